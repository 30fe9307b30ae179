//! A typeset source document, held as its serial string.
//!
//! Markers are byte offsets into the serial; selections are marker pairs.
//! The compiler only reads the text and annotates errors; geometry belongs
//! to the editor.

use std::path::PathBuf;
use std::rc::Rc;

pub type ModelId = usize;

/// A position in a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Marker {
    pub model: ModelId,
    pub index: usize,
}

impl Marker {
    pub fn new(model: ModelId, index: usize) -> Self {
        Marker { model, index }
    }
}

/// A pair of markers into one document. Every parse-tree node, error, and
/// symbol usage carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selection {
    pub model: ModelId,
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(left: Marker, right: Marker) -> Self {
        debug_assert_eq!(left.model, right.model);
        Selection {
            model: left.model,
            start: left.index,
            end: right.index,
        }
    }

    pub fn from_span(model: ModelId, start: usize, end: usize) -> Self {
        Selection { model, start, end }
    }

    pub fn left(&self) -> Marker {
        Marker::new(self.model, self.start)
    }

    pub fn right(&self) -> Marker {
        Marker::new(self.model, self.end)
    }

    /// Smallest selection spanning both operands.
    pub fn merge(&self, other: &Selection) -> Selection {
        debug_assert_eq!(self.model, other.model);
        Selection {
            model: self.model,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

pub struct Model {
    pub path: PathBuf,
    pub source: Rc<str>,
    pub line_starts: Vec<usize>,
    /// Scanner-recorded scope depth per line, for the editor.
    pub line_scope_depth: Vec<usize>,
    /// Cleared on Program reset so recompilation re-walks imports.
    pub is_imported: bool,
}

impl Model {
    pub fn new(path: PathBuf, source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        let line_count = line_starts.len();
        Model {
            path,
            source: Rc::from(source),
            line_starts,
            line_scope_depth: vec![0; line_count],
            is_imported: false,
        }
    }

    /// 1-based line number containing the byte offset.
    pub fn line_of(&self, index: usize) -> usize {
        match self.line_starts.binary_search(&index) {
            Ok(line) => line + 1,
            Err(line) => line,
        }
    }

    pub fn text(&self, sel: &Selection) -> &str {
        &self.source[sel.start..sel.end.min(self.source.len())]
    }

    /// Module identifier: last path component minus extension.
    pub fn file_stem(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_of_start_is_one() {
        let model = Model::new(PathBuf::from("a.nte"), "x = 1\ny = 2\n");
        assert_eq!(model.line_of(0), 1);
    }

    #[test]
    fn line_of_counts_newlines() {
        let model = Model::new(PathBuf::from("a.nte"), "x = 1\ny = 2\nz = 3");
        assert_eq!(model.line_of(6), 2);
        assert_eq!(model.line_of(12), 3);
    }

    #[test]
    fn text_extracts_selection() {
        let model = Model::new(PathBuf::from("a.nte"), "alpha beta");
        let sel = Selection::from_span(0, 6, 10);
        assert_eq!(model.text(&sel), "beta");
    }

    #[test]
    fn merge_spans_both_selections() {
        let a = Selection::from_span(0, 2, 5);
        let b = Selection::from_span(0, 7, 9);
        let merged = a.merge(&b);
        assert_eq!((merged.start, merged.end), (2, 9));
    }

    #[test]
    fn file_stem_drops_extension() {
        let model = Model::new(PathBuf::from("/lib/kinematics.nte"), "");
        assert_eq!(model.file_stem(), "kinematics");
    }
}
