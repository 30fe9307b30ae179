//! Process-wide compilation context: the model registry, error stream,
//! settings, and interner, threaded explicitly through every pass.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::errors::{ErrorCode, ErrorStream, WarningLevel};
use crate::intern::{Interner, Name};
use crate::model::{Model, ModelId, Selection};
use crate::serial;
use crate::settings::Settings;

/// Result of opening a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileResult {
    Opened(ModelId),
    AlreadyOpen(ModelId),
    NotFound,
    Corrupted,
}

impl FileResult {
    /// The model id when the file is usable, however it was reached.
    pub fn model(self) -> Option<ModelId> {
        match self {
            FileResult::Opened(id) | FileResult::AlreadyOpen(id) => Some(id),
            _ => None,
        }
    }
}

/// Extensions tried, in order, when an import omits one.
pub const EXTENSIONS: [&str; 2] = ["nte", "txt"];

pub struct Program {
    pub models: Vec<Model>,
    pub by_path: HashMap<PathBuf, ModelId>,
    pub project_paths: Vec<PathBuf>,
    pub error_stream: ErrorStream,
    pub settings: Settings,
    pub interner: Interner,
    pub entry: Option<ModelId>,
}

impl Program {
    pub fn new() -> Self {
        let mut project_paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            project_paths.push(cwd);
        }
        Program {
            models: Vec::new(),
            by_path: HashMap::new(),
            project_paths,
            error_stream: ErrorStream::new(),
            settings: Settings::new(),
            interner: Interner::new(),
            entry: None,
        }
    }

    /// Clear per-compilation state. Models stay registered; their
    /// `is_imported` flags are cleared so imports are re-walked.
    pub fn reset(&mut self) {
        self.error_stream.reset();
        self.settings.reset();
        for model in &mut self.models {
            model.is_imported = false;
        }
    }

    pub fn model(&self, id: ModelId) -> &Model {
        &self.models[id]
    }

    pub fn model_mut(&mut self, id: ModelId) -> &mut Model {
        &mut self.models[id]
    }

    /// Register a document from in-memory source and make it the entry
    /// point. The serial must validate.
    pub fn set_entry_source(&mut self, path: PathBuf, source: &str) -> FileResult {
        let result = self.open_from_source(path, source);
        if let Some(id) = result.model() {
            self.entry = Some(id);
        }
        result
    }

    pub fn open_from_source(&mut self, path: PathBuf, source: &str) -> FileResult {
        if let Some(&id) = self.by_path.get(&path) {
            return FileResult::AlreadyOpen(id);
        }
        let normalised = source.replace("\r\n", "\n");
        if !serial::is_valid_serial(&normalised) {
            return FileResult::Corrupted;
        }
        let id = self.models.len();
        self.models.push(Model::new(path.clone(), &normalised));
        self.by_path.insert(path, id);
        debug!("opened model {id}");
        FileResult::Opened(id)
    }

    pub fn open_from_absolute_path(&mut self, path: &Path) -> FileResult {
        if let Some(&id) = self.by_path.get(path) {
            return FileResult::AlreadyOpen(id);
        }
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(_) => return FileResult::NotFound,
        };
        self.open_from_source(path.to_path_buf(), &source)
    }

    /// Resolve an import path: each project-path entry, then each accepted
    /// extension when the import omits one. `importing_dir` (the importing
    /// file's directory) is tried first.
    pub fn open_from_relative_path(
        &mut self,
        file_name: &str,
        importing_dir: Option<&Path>,
    ) -> FileResult {
        let rel = Path::new(file_name);
        if rel.is_absolute() {
            return self.open_from_absolute_path(rel);
        }

        let mut roots: Vec<PathBuf> = Vec::new();
        if let Some(dir) = importing_dir {
            roots.push(dir.to_path_buf());
        }
        roots.extend(self.project_paths.iter().cloned());

        let has_extension = rel.extension().is_some();
        for root in &roots {
            let candidate = root.join(rel);
            if has_extension {
                match self.open_from_absolute_path(&candidate) {
                    FileResult::NotFound => continue,
                    found => return found,
                }
            } else {
                for ext in EXTENSIONS {
                    let candidate = candidate.with_extension(ext);
                    match self.open_from_absolute_path(&candidate) {
                        FileResult::NotFound => continue,
                        found => return found,
                    }
                }
            }
        }
        FileResult::NotFound
    }

    // Diagnostics -----------------------------------------------------------

    pub fn line_of(&self, sel: &Selection) -> usize {
        self.models[sel.model].line_of(sel.start)
    }

    pub fn selection_text(&self, sel: &Selection) -> &str {
        self.models[sel.model].text(sel)
    }

    pub fn fail(&mut self, sel: Selection, code: ErrorCode) {
        let line = self.line_of(&sel);
        let quoted = self.models[sel.model].text(&sel).to_string();
        self.error_stream.fail(sel, code, line, &quoted);
    }

    pub fn fail_with_message(&mut self, sel: Selection, message: &str, code: ErrorCode) {
        let line = self.line_of(&sel);
        self.error_stream.fail_with_message(sel, message, code, line);
    }

    pub fn warn(&mut self, level: WarningLevel, sel: Selection, code: ErrorCode) {
        let line = self.line_of(&sel);
        let quoted = self.models[sel.model].text(&sel).to_string();
        self.error_stream.warn(level, sel, code, line, &quoted);
    }

    pub fn no_errors(&self) -> bool {
        self.error_stream.no_errors()
    }

    pub fn intern_selection(&mut self, sel: &Selection) -> Name {
        let source = self.models[sel.model].source.clone();
        self.interner
            .intern(&source[sel.start..sel.end.min(source.len())])
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_source_registers_model() {
        let mut program = Program::new();
        let result = program.set_entry_source(PathBuf::from("main.nte"), "print(1)");
        assert!(matches!(result, FileResult::Opened(0)));
        assert_eq!(program.entry, Some(0));
    }

    #[test]
    fn reopening_same_path_reports_already_open() {
        let mut program = Program::new();
        program.set_entry_source(PathBuf::from("main.nte"), "x = 1");
        let again = program.open_from_source(PathBuf::from("main.nte"), "x = 1");
        assert_eq!(again, FileResult::AlreadyOpen(0));
    }

    #[test]
    fn invalid_serial_is_corrupted() {
        let mut program = Program::new();
        let bad = format!("x{}", crate::serial::CLOSE);
        let result = program.open_from_source(PathBuf::from("bad.nte"), &bad);
        assert_eq!(result, FileResult::Corrupted);
    }

    #[test]
    fn missing_file_is_not_found() {
        let mut program = Program::new();
        let result = program.open_from_relative_path("definitely_missing_module", None);
        assert_eq!(result, FileResult::NotFound);
    }

    #[test]
    fn crlf_is_normalised() {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("m.nte"), "a = 1\r\nb = 2")
            .model()
            .unwrap();
        assert!(!program.model(id).source.contains('\r'));
    }

    #[test]
    fn fail_records_line_number() {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("m.nte"), "a = 1\nb = oops")
            .model()
            .unwrap();
        program.fail(Selection::from_span(id, 10, 14), ErrorCode::BadRead);
        assert_eq!(program.error_stream.errors[0].line(), 2);
    }

    #[test]
    fn reset_clears_imported_flags() {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("m.nte"), "x = 1")
            .model()
            .unwrap();
        program.model_mut(id).is_imported = true;
        program.reset();
        assert!(!program.model(id).is_imported);
    }
}
