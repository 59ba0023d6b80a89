//! Three-way text merge seam
//!
//! The diff/merge primitive is an external collaborator consumed through
//! [`TextMerger`]. The engine supplies the three inputs with revision
//! labels and acts on the returned status; how the merge is computed is
//! the implementation's business. [`ConservativeMerger`] is the built-in:
//! it resolves only the trivial cases and declares everything else a
//! conflict, which is also what log replay falls back to during recovery.

/// Result status of a three-way merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    /// Neither side changed anything; output equals the working text.
    Unchanged,
    /// Changes combined without overlap.
    Merged,
    /// Overlapping changes; output carries conflict markers.
    Conflicted,
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub merged_text: Vec<u8>,
    pub status: MergeStatus,
}

/// Labels identifying the three inputs in conflict markers, conventionally
/// `.mine` and the two revision names.
#[derive(Debug, Clone)]
pub struct MergeLabels {
    pub base: String,
    pub theirs: String,
    pub mine: String,
}

pub trait TextMerger {
    /// Merge `theirs` (new server text) and `mine` (local working text)
    /// against their common ancestor `base`.
    fn merge(&self, base: &[u8], theirs: &[u8], mine: &[u8], labels: &MergeLabels)
    -> MergeResult;
}

/// Trivial-case merger: takes whichever side is unchanged and marks the
/// rest conflicted rather than guessing at line-level interleaving.
pub struct ConservativeMerger;

impl TextMerger for ConservativeMerger {
    fn merge(
        &self,
        base: &[u8],
        theirs: &[u8],
        mine: &[u8],
        labels: &MergeLabels,
    ) -> MergeResult {
        if theirs == base || theirs == mine {
            return MergeResult {
                merged_text: mine.to_vec(),
                status: MergeStatus::Unchanged,
            };
        }
        if mine == base {
            return MergeResult {
                merged_text: theirs.to_vec(),
                status: MergeStatus::Merged,
            };
        }

        let mut out = Vec::new();
        out.extend_from_slice(format!("<<<<<<< {}\n", labels.mine).as_bytes());
        out.extend_from_slice(mine);
        ensure_newline(&mut out);
        out.extend_from_slice(format!("||||||| {}\n", labels.base).as_bytes());
        out.extend_from_slice(base);
        ensure_newline(&mut out);
        out.extend_from_slice(b"=======\n");
        out.extend_from_slice(theirs);
        ensure_newline(&mut out);
        out.extend_from_slice(format!(">>>>>>> {}\n", labels.theirs).as_bytes());
        MergeResult {
            merged_text: out,
            status: MergeStatus::Conflicted,
        }
    }
}

fn ensure_newline(buf: &mut Vec<u8>) {
    if !buf.ends_with(b"\n") {
        buf.push(b'\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> MergeLabels {
        MergeLabels {
            base: ".r5".to_string(),
            theirs: ".r7".to_string(),
            mine: ".mine".to_string(),
        }
    }

    #[test]
    fn test_their_side_unchanged_keeps_mine() {
        let m = ConservativeMerger;
        let r = m.merge(b"a\n", b"a\n", b"local\n", &labels());
        assert_eq!(r.status, MergeStatus::Unchanged);
        assert_eq!(r.merged_text, b"local\n");
    }

    #[test]
    fn test_mine_unchanged_takes_theirs() {
        let m = ConservativeMerger;
        let r = m.merge(b"a\n", b"server\n", b"a\n", &labels());
        assert_eq!(r.status, MergeStatus::Merged);
        assert_eq!(r.merged_text, b"server\n");
    }

    #[test]
    fn test_identical_changes_are_unchanged() {
        let m = ConservativeMerger;
        let r = m.merge(b"a\n", b"same\n", b"same\n", &labels());
        assert_eq!(r.status, MergeStatus::Unchanged);
        assert_eq!(r.merged_text, b"same\n");
    }

    #[test]
    fn test_overlap_conflicts_with_markers() {
        let m = ConservativeMerger;
        let r = m.merge(b"a\n", b"server\n", b"local\n", &labels());
        assert_eq!(r.status, MergeStatus::Conflicted);
        let text = String::from_utf8(r.merged_text).unwrap();
        assert!(text.contains("<<<<<<< .mine"));
        assert!(text.contains("local"));
        assert!(text.contains("server"));
        assert!(text.contains(">>>>>>> .r7"));
    }
}
