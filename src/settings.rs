//! Lexically scoped program settings.
//!
//! A settings construct updates warning levels for the remainder of its
//! lexical scope; leaving the scope restores the previous levels.

use crate::errors::WarningLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    Shadowing,
    UnusedVar,
    UnusedExpression,
    TransposeT,
}

pub const SETTING_COUNT: usize = 4;

impl SettingId {
    pub fn from_key(key: &str) -> Option<SettingId> {
        match key.trim() {
            "shadowing" => Some(SettingId::Shadowing),
            "unused-var" => Some(SettingId::UnusedVar),
            "unused-expression" => Some(SettingId::UnusedExpression),
            "transpose-t" => Some(SettingId::TransposeT),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            SettingId::Shadowing => 0,
            SettingId::UnusedVar => 1,
            SettingId::UnusedExpression => 2,
            SettingId::TransposeT => 3,
        }
    }
}

fn level_from_value(value: &str) -> Option<WarningLevel> {
    match value.trim() {
        "none" => Some(WarningLevel::NoWarning),
        "warn" => Some(WarningLevel::Warn),
        "error" => Some(WarningLevel::Error),
        _ => None,
    }
}

/// Parse the body of a settings construct: `key=value(,key=value)*`.
/// Unknown keys or values are skipped.
pub fn parse_updates(text: &str) -> Vec<(SettingId, WarningLevel)> {
    let mut updates = Vec::new();
    for pair in text.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if let (Some(id), Some(level)) = (SettingId::from_key(key), level_from_value(value)) {
            updates.push((id, level));
        }
    }
    updates
}

pub struct Settings {
    levels: [WarningLevel; SETTING_COUNT],
    saved: Vec<[WarningLevel; SETTING_COUNT]>,
}

impl Settings {
    pub fn new() -> Self {
        Settings {
            levels: [
                WarningLevel::Warn,      // shadowing
                WarningLevel::Warn,      // unused-var
                WarningLevel::Warn,      // unused-expression
                WarningLevel::NoWarning, // transpose-t
            ],
            saved: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Settings::new();
    }

    pub fn level(&self, id: SettingId) -> WarningLevel {
        self.levels[id.index()]
    }

    pub fn update(&mut self, id: SettingId, level: WarningLevel) {
        self.levels[id.index()] = level;
    }

    pub fn enter_scope(&mut self) {
        self.saved.push(self.levels);
    }

    pub fn leave_scope(&mut self) {
        if let Some(levels) = self.saved.pop() {
            self.levels = levels;
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_warn_on_shadowing() {
        let settings = Settings::new();
        assert_eq!(settings.level(SettingId::Shadowing), WarningLevel::Warn);
    }

    #[test]
    fn update_changes_level() {
        let mut settings = Settings::new();
        settings.update(SettingId::Shadowing, WarningLevel::Error);
        assert_eq!(settings.level(SettingId::Shadowing), WarningLevel::Error);
    }

    #[test]
    fn leave_scope_restores_levels() {
        let mut settings = Settings::new();
        settings.enter_scope();
        settings.update(SettingId::UnusedVar, WarningLevel::NoWarning);
        settings.leave_scope();
        assert_eq!(settings.level(SettingId::UnusedVar), WarningLevel::Warn);
    }

    #[test]
    fn parse_updates_reads_pairs() {
        let updates = parse_updates("shadowing=error,unused-var=none");
        assert_eq!(
            updates,
            vec![
                (SettingId::Shadowing, WarningLevel::Error),
                (SettingId::UnusedVar, WarningLevel::NoWarning),
            ]
        );
    }

    #[test]
    fn parse_updates_skips_unknown_keys() {
        assert!(parse_updates("mystery=warn").is_empty());
    }
}
