//! Keyword/EOL translation seam
//!
//! Content translation is an external collaborator: the engine calls it
//! around file materialization but never implements it. `translate`
//! expands repository-normal content into working form; `detranslate`
//! reverses it for comparisons against the text base.

pub trait Translator {
    fn translate(&self, content: &[u8]) -> Vec<u8>;
    fn detranslate(&self, content: &[u8]) -> Vec<u8>;
}

/// Pass-through translator for callers without keyword/EOL handling and
/// for log replay during recovery.
pub struct NoopTranslator;

impl Translator for NoopTranslator {
    fn translate(&self, content: &[u8]) -> Vec<u8> {
        content.to_vec()
    }

    fn detranslate(&self, content: &[u8]) -> Vec<u8> {
        content.to_vec()
    }
}
