//! The pure reconciliation function (spec §4.G). Grounded in
//! `lansync/sync_logic.py`'s `decide` and `lansync/sync_action.py`'s
//! `Action` subclasses — collapsed here into one enum since Rust doesn't
//! need a class per variant to carry per-variant data.

use crate::model::{LocalNode, RemoteNode, StoredNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Nop,
    DeleteStored,
    DeleteLocal,
    Upload,
    DeleteRemote,
    SaveStored,
    Download,
    Conflict,
}

/// Total function over the presence/absence of the three views of a key.
/// Mirrors the decision table in spec §4.G exactly; `S.ready = false` (an
/// interrupted download) forces `Download` regardless of the other
/// comparisons once all three are present.
pub fn decide(remote: Option<&RemoteNode>, local: Option<&LocalNode>, stored: Option<&StoredNode>) -> Action {
    match (remote, local, stored) {
        (None, None, None) => Action::Nop,
        (None, None, Some(_)) => Action::DeleteStored,
        (None, Some(_), None) => Action::Upload,
        (None, Some(_), Some(_)) => Action::DeleteLocal,
        (Some(_), None, None) => Action::Download,
        (Some(_), None, Some(_)) => Action::DeleteRemote,
        (Some(r), Some(l), None) => {
            if r.checksum == l.checksum {
                Action::SaveStored
            } else {
                Action::Conflict
            }
        }
        (Some(r), Some(l), Some(s)) => {
            if !s.ready {
                return Action::Download;
            }
            let local_updated = l.updated(s);
            let remote_updated = r.updated(s);
            match (local_updated, remote_updated) {
                (true, true) => {
                    if r.checksum == l.checksum {
                        Action::SaveStored
                    } else {
                        Action::Conflict
                    }
                }
                (true, false) => Action::Upload,
                (false, true) => Action::Download,
                (false, false) => Action::Nop,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeChunk;

    fn remote(checksum: &str) -> RemoteNode {
        RemoteNode {
            namespace: "ns".into(),
            key: "k".into(),
            sequence_number: 1,
            path: "a.txt".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
            checksum: Some(checksum.to_string()),
            size: 10,
            chunks: vec![NodeChunk { hash: "h".into(), size: 10, offset: 0 }],
            signature: None,
        }
    }

    fn local(mtime: i64, ctime: i64, checksum: &str) -> LocalNode {
        let mut l = LocalNode::new(std::path::PathBuf::from("/root"), "a.txt".into(), mtime, ctime, 10);
        l.checksum = Some(checksum.to_string());
        l
    }

    fn stored(checksum: &str, mtime: i64, ctime: i64, ready: bool) -> StoredNode {
        StoredNode {
            id: 1,
            namespace: "ns".into(),
            key: "k".into(),
            path: "a.txt".into(),
            checksum: Some(checksum.to_string()),
            size: 10,
            signature: None,
            local_mtime: mtime,
            local_ctime: ctime,
            ready,
        }
    }

    #[test]
    fn nothing_anywhere_is_nop() {
        assert_eq!(decide(None, None, None), Action::Nop);
    }

    #[test]
    fn stored_only_deletes_stored() {
        let s = stored("c", 0, 0, true);
        assert_eq!(decide(None, None, Some(&s)), Action::DeleteStored);
    }

    #[test]
    fn local_only_uploads() {
        let l = local(1, 1, "c");
        assert_eq!(decide(None, Some(&l), None), Action::Upload);
    }

    #[test]
    fn local_and_stored_deletes_local() {
        let l = local(1, 1, "c");
        let s = stored("c", 1, 1, true);
        assert_eq!(decide(None, Some(&l), Some(&s)), Action::DeleteLocal);
    }

    #[test]
    fn remote_only_downloads() {
        let r = remote("c");
        assert_eq!(decide(Some(&r), None, None), Action::Download);
    }

    #[test]
    fn remote_and_stored_deletes_remote() {
        let r = remote("c");
        let s = stored("c", 1, 1, true);
        assert_eq!(decide(Some(&r), None, Some(&s)), Action::DeleteRemote);
    }

    #[test]
    fn remote_and_local_matching_checksum_saves_stored() {
        let r = remote("same");
        let l = local(1, 1, "same");
        assert_eq!(decide(Some(&r), Some(&l), None), Action::SaveStored);
    }

    #[test]
    fn remote_and_local_mismatched_checksum_conflicts() {
        let r = remote("one");
        let l = local(1, 1, "other");
        assert_eq!(decide(Some(&r), Some(&l), None), Action::Conflict);
    }

    #[test]
    fn not_ready_forces_download_regardless() {
        let r = remote("c");
        let l = local(1, 1, "c");
        let s = stored("c", 1, 1, false);
        assert_eq!(decide(Some(&r), Some(&l), Some(&s)), Action::Download);
    }

    #[test]
    fn all_three_unchanged_is_nop() {
        let r = remote("c");
        let l = local(1, 1, "c");
        let s = stored("c", 1, 1, true);
        assert_eq!(decide(Some(&r), Some(&l), Some(&s)), Action::Nop);
    }

    #[test]
    fn only_local_updated_uploads() {
        let r = remote("c");
        let l = local(2, 2, "c2");
        let s = stored("c", 1, 1, true);
        assert_eq!(decide(Some(&r), Some(&l), Some(&s)), Action::Upload);
    }

    #[test]
    fn only_remote_updated_downloads() {
        let r = remote("c2");
        let l = local(1, 1, "c");
        let s = stored("c", 1, 1, true);
        assert_eq!(decide(Some(&r), Some(&l), Some(&s)), Action::Download);
    }

    #[test]
    fn both_updated_matching_remote_checksum_saves_stored() {
        let r = remote("target");
        let l = local(2, 2, "target");
        let s = stored("original", 1, 1, true);
        assert_eq!(decide(Some(&r), Some(&l), Some(&s)), Action::SaveStored);
    }

    #[test]
    fn both_updated_mismatched_checksum_conflicts() {
        let r = remote("one");
        let l = local(2, 2, "two");
        let s = stored("three", 1, 1, true);
        assert_eq!(decide(Some(&r), Some(&l), Some(&s)), Action::Conflict);
    }
}
