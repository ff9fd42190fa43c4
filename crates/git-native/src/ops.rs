use std::path::Path;

use gix::object::tree::EntryKind;
use gix::refs::transaction::{Change, LogChange, PreviousValue, RefEdit, RefLog};
use gix::{ObjectId, Repository};

use crate::error::{GitStorageError, Result};

/// Wrap any gix-compatible error into [`GitStorageError::Gix`].
pub fn gix_err(e: impl std::error::Error + Send + Sync + 'static) -> GitStorageError {
    GitStorageError::Gix(Box::new(e))
}

/// Open a bare or non-bare git repository at `repo_path`.
///
/// Returns [`GitStorageError::NotARepo`] when neither `.git` nor a bare
/// layout (`HEAD` at the top level) is present.
pub fn open_repo(repo_path: &Path) -> Result<Repository> {
    let repo = gix::open(repo_path).map_err(|e| {
        if repo_path.join(".git").exists() || repo_path.join("HEAD").exists() {
            gix_err(e)
        } else {
            GitStorageError::NotARepo(repo_path.to_path_buf())
        }
    })?;
    Ok(repo)
}

/// Parse a hex object id coming from a client.
pub fn parse_id(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex.as_bytes()).map_err(|_| GitStorageError::InvalidObjectId(hex.to_string()))
}

/// Find the tip commit of a ref, returning `None` if the ref doesn't exist.
pub fn find_ref_tip<'r>(repo: &'r Repository, ref_name: &str) -> Result<Option<gix::Id<'r>>> {
    match repo.try_find_reference(ref_name).map_err(gix_err)? {
        Some(reference) => {
            let id = reference.into_fully_peeled_id().map_err(gix_err)?;
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

/// Get the tree [`ObjectId`] from a commit.
pub fn commit_tree_id(repo: &Repository, commit_id: ObjectId) -> Result<ObjectId> {
    let commit = repo
        .find_object(commit_id)
        .map_err(gix_err)?
        .try_into_commit()
        .map_err(gix_err)?;
    let tree_id = commit.tree_id().map_err(gix_err)?;
    Ok(tree_id.detach())
}

/// Committer/author signature for commits produced by repository sync.
pub fn make_signature() -> gix::actor::Signature {
    gix::actor::Signature {
        name: "devcell".into(),
        email: "sync@devcell.dev".into(),
        time: gix::date::Time::now_local_or_utc(),
    }
}

/// Write `base_tree` with every `(path, blob)` upserted and return the new tree.
pub fn write_tree_with(
    repo: &Repository,
    base_tree: ObjectId,
    entries: &[(String, ObjectId)],
) -> Result<ObjectId> {
    let mut editor = repo.edit_tree(base_tree).map_err(gix_err)?;
    for (path, blob) in entries {
        editor
            .upsert(path.as_str(), EntryKind::Blob, *blob)
            .map_err(gix_err)?;
    }
    Ok(editor.write().map_err(gix_err)?.detach())
}

/// Write a commit object without moving any ref.
pub fn write_commit(
    repo: &Repository,
    tree_id: ObjectId,
    parent: Option<ObjectId>,
    message: &str,
) -> Result<ObjectId> {
    let sig = make_signature();
    let parents: Vec<ObjectId> = parent.into_iter().collect();

    let commit = gix::objs::Commit {
        message: message.into(),
        tree: tree_id,
        author: sig.clone(),
        committer: sig,
        encoding: None,
        parents: parents.into(),
        extra_headers: Default::default(),
    };

    Ok(repo.write_object(&commit).map_err(gix_err)?.detach())
}

/// Point `ref_name` at `new_tip`.
///
/// With `expected_tip = Some(p)` the ref must currently point at `p`; with
/// `None` it must not exist yet. The check and the write are one atomic
/// ref transaction.
pub fn set_ref_tip(
    repo: &Repository,
    ref_name: &str,
    expected_tip: Option<ObjectId>,
    new_tip: ObjectId,
    message: &str,
) -> Result<()> {
    let expected = match expected_tip {
        Some(p) => PreviousValue::ExistingMustMatch(gix::refs::Target::Object(p)),
        None => PreviousValue::MustNotExist,
    };
    repo.edit_references([RefEdit {
        change: Change::Update {
            log: LogChange {
                mode: RefLog::AndReference,
                force_create_reflog: false,
                message: message.into(),
            },
            expected,
            new: gix::refs::Target::Object(new_tip),
        },
        name: ref_name
            .try_into()
            .map_err(|e: gix::validate::reference::name::Error| gix_err(e))?,
        deref: false,
    }])
    .map_err(gix_err)?;
    Ok(())
}

/// Create a commit on `ref_name`, optionally with a parent, and move the ref.
pub fn create_commit(
    repo: &Repository,
    ref_name: &str,
    tree_id: ObjectId,
    parent: Option<ObjectId>,
    message: &str,
) -> Result<ObjectId> {
    let commit_id = write_commit(repo, tree_id, parent, message)?;
    set_ref_tip(repo, ref_name, parent, commit_id, message)?;
    Ok(commit_id)
}

/// Every blob reachable from `tree_id`, as `(path, id)` with `/`-joined paths.
pub fn list_blobs(repo: &Repository, tree_id: ObjectId) -> Result<Vec<(String, ObjectId)>> {
    let mut out = Vec::new();
    collect_blobs(repo, tree_id, "", &mut out)?;
    Ok(out)
}

fn collect_blobs(
    repo: &Repository,
    tree_id: ObjectId,
    prefix: &str,
    out: &mut Vec<(String, ObjectId)>,
) -> Result<()> {
    let tree = repo.find_tree(tree_id).map_err(gix_err)?;
    for entry in tree.iter() {
        let entry = entry.map_err(gix_err)?;
        let name = entry.filename().to_string();
        let path = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let mode = entry.mode();
        if mode.is_tree() {
            collect_blobs(repo, entry.object_id(), &path, out)?;
        } else if mode.is_blob() {
            out.push((path, entry.object_id()));
        }
    }
    Ok(())
}

/// Raw bytes of a blob, `None` if the object is absent.
pub fn read_blob(repo: &Repository, id: ObjectId) -> Result<Option<Vec<u8>>> {
    let Some(object) = repo.try_find_object(id).map_err(gix_err)? else {
        return Ok(None);
    };
    if object.kind != gix::object::Kind::Blob {
        return Err(GitStorageError::Other(format!("{id} is not a blob")));
    }
    Ok(Some(object.data.clone()))
}
