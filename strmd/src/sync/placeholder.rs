use std::io;
use std::path::{Component, Path, PathBuf};

use strm_core::ShareRef;
use thiserror::Error;
use url::Url;

use crate::config::{OverwritePolicy, SyncRootMapping};

#[derive(Debug, Error)]
pub enum PlaceholderError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("{path} is not below mapping root {root}")]
    OutsideRoot { path: String, root: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What a placeholder's redirect URL points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderSource {
    Pickcode(String),
    Share(ShareRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Replaced,
    Unchanged,
    /// A different placeholder exists and the policy forbids overwriting it.
    Kept,
}

/// Local mirror of `remote_path` under the mapping, with no extension change.
pub fn local_path_for(
    mapping: &SyncRootMapping,
    remote_path: &str,
) -> Result<PathBuf, PlaceholderError> {
    if remote_path.is_empty() {
        return Err(PlaceholderError::Empty);
    }
    if !mapping.contains_remote(remote_path) {
        return Err(PlaceholderError::OutsideRoot {
            path: remote_path.to_string(),
            root: mapping.remote_root.clone(),
        });
    }
    let relative = if mapping.remote_root == "/" {
        remote_path
    } else {
        &remote_path[mapping.remote_root.len()..]
    };

    let mut out = mapping.local_root.clone();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PlaceholderError::UnsupportedComponent(
                    remote_path.to_string(),
                ));
            }
        }
    }
    Ok(out)
}

/// Placeholder path for a media file: rebased, extension swapped.
pub fn target_path(
    mapping: &SyncRootMapping,
    remote_path: &str,
    placeholder_ext: &str,
) -> Result<PathBuf, PlaceholderError> {
    let local = local_path_for(mapping, remote_path)?;
    if local == mapping.local_root {
        return Err(PlaceholderError::UnsupportedComponent(
            remote_path.to_string(),
        ));
    }
    Ok(local.with_extension(placeholder_ext.trim_start_matches('.')))
}

/// Inverse of [`target_path`] for the directory part: the remote folder
/// that a local directory under the mapping mirrors.
pub fn remote_dir_for(mapping: &SyncRootMapping, local_dir: &Path) -> Option<String> {
    let relative = local_dir.strip_prefix(&mapping.local_root).ok()?;
    let mut remote = mapping.remote_root.trim_end_matches('/').to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            remote.push('/');
            remote.push_str(&part.to_string_lossy());
        }
    }
    if remote.is_empty() {
        remote.push('/');
    }
    Some(remote)
}

pub fn placeholder_url(base: &Url, source: &PlaceholderSource) -> Url {
    let mut url = base.clone();
    let path = format!("{}/redirect", base.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        match source {
            PlaceholderSource::Pickcode(pickcode) => {
                query.append_pair("pickcode", pickcode);
            }
            PlaceholderSource::Share(share) => {
                query
                    .append_pair("share_code", &share.share_code)
                    .append_pair("receive_code", &share.receive_code)
                    .append_pair("id", &share.file_id.to_string());
            }
        }
    }
    url
}

pub async fn write_placeholder(
    path: &Path,
    content: &str,
    policy: OverwritePolicy,
) -> Result<WriteOutcome, PlaceholderError> {
    let outcome = match tokio::fs::read_to_string(path).await {
        Ok(existing) if existing.trim_end() == content => return Ok(WriteOutcome::Unchanged),
        Ok(_) if policy == OverwritePolicy::Never => return Ok(WriteOutcome::Kept),
        Ok(_) => WriteOutcome::Replaced,
        Err(err) if err.kind() == io::ErrorKind::NotFound => WriteOutcome::Created,
        // Not valid UTF-8, so it is not one of ours.
        Err(err) if err.kind() == io::ErrorKind::InvalidData => match policy {
            OverwritePolicy::Never => return Ok(WriteOutcome::Kept),
            OverwritePolicy::Replace => WriteOutcome::Replaced,
        },
        Err(err) => return Err(err.into()),
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(path);
    tokio::fs::write(&partial, content.as_bytes()).await?;
    tokio::fs::rename(&partial, path).await?;
    Ok(outcome)
}

/// Returns `false` when there was nothing to remove.
pub async fn remove_placeholder(path: &Path) -> Result<bool, PlaceholderError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

pub async fn remove_tree(path: &Path) -> Result<bool, PlaceholderError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Removes `dir` and its parents while they are empty, at most `max_depth`
/// levels, never touching `root` or anything outside it.
pub async fn prune_empty_ancestors(
    dir: &Path,
    root: &Path,
    max_depth: usize,
) -> Result<usize, PlaceholderError> {
    let mut removed = 0;
    let mut current = dir.to_path_buf();
    while removed < max_depth && current != root && current.starts_with(root) {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => break,
            Err(err) => return Err(err.into()),
        };
        if entries.next_entry().await?.is_some() {
            break;
        }
        tokio::fs::remove_dir(&current).await?;
        removed += 1;
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
    Ok(removed)
}

/// Lowercased extension including the dot, e.g. `.mkv`.
pub fn file_ext(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn movies() -> SyncRootMapping {
        SyncRootMapping::new("/strm/Movies", "/Movies")
    }

    #[test]
    fn rebases_and_swaps_extension() {
        let target = target_path(&movies(), "/Movies/Foo (2020)/Foo.mkv", ".strm").unwrap();
        assert_eq!(target, PathBuf::from("/strm/Movies/Foo (2020)/Foo.strm"));

        let local = local_path_for(&movies(), "/Movies/Foo (2020)/Foo.srt").unwrap();
        assert_eq!(local, PathBuf::from("/strm/Movies/Foo (2020)/Foo.srt"));
    }

    #[test]
    fn rejects_paths_outside_the_mapping() {
        assert!(matches!(
            target_path(&movies(), "/MoviesExtra/Foo.mkv", ".strm"),
            Err(PlaceholderError::OutsideRoot { .. })
        ));
        assert!(matches!(
            local_path_for(&movies(), "/Movies/../etc/passwd"),
            Err(PlaceholderError::UnsupportedComponent(_))
        ));
        assert!(matches!(
            local_path_for(&movies(), ""),
            Err(PlaceholderError::Empty)
        ));
    }

    #[test]
    fn maps_local_dirs_back_to_remote() {
        let remote = remote_dir_for(&movies(), Path::new("/strm/Movies/Foo (2020)"));
        assert_eq!(remote.as_deref(), Some("/Movies/Foo (2020)"));
        let root = SyncRootMapping::new("/strm", "/");
        assert_eq!(
            remote_dir_for(&root, Path::new("/strm")).as_deref(),
            Some("/")
        );
        assert_eq!(remote_dir_for(&movies(), Path::new("/elsewhere")), None);
    }

    #[test]
    fn builds_pickcode_and_share_urls() {
        let base = Url::parse("http://127.0.0.1:9115").unwrap();
        let url = placeholder_url(
            &base,
            &PlaceholderSource::Pickcode("ABCDEFGHIJKLMNOPQ".into()),
        );
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9115/redirect?pickcode=ABCDEFGHIJKLMNOPQ"
        );

        let base = Url::parse("https://media.lan/strm/").unwrap();
        let share = PlaceholderSource::Share(ShareRef {
            share_code: "sw1abc".into(),
            receive_code: "x1y2".into(),
            file_id: 3,
        });
        let url = placeholder_url(&base, &share);
        assert_eq!(
            url.as_str(),
            "https://media.lan/strm/redirect?share_code=sw1abc&receive_code=x1y2&id=3"
        );
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(file_ext("Foo.MKV").as_deref(), Some(".mkv"));
        assert_eq!(file_ext("README"), None);
        assert_eq!(file_ext(".hidden"), None);
    }

    #[tokio::test]
    async fn write_respects_overwrite_policy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/Foo.strm");

        let first = write_placeholder(&path, "http://x/redirect?pickcode=1", OverwritePolicy::Never)
            .await
            .unwrap();
        assert_eq!(first, WriteOutcome::Created);
        let again = write_placeholder(&path, "http://x/redirect?pickcode=1", OverwritePolicy::Never)
            .await
            .unwrap();
        assert_eq!(again, WriteOutcome::Unchanged);

        let kept = write_placeholder(&path, "http://x/redirect?pickcode=2", OverwritePolicy::Never)
            .await
            .unwrap();
        assert_eq!(kept, WriteOutcome::Kept);
        let replaced =
            write_placeholder(&path, "http://x/redirect?pickcode=2", OverwritePolicy::Replace)
                .await
                .unwrap();
        assert_eq!(replaced, WriteOutcome::Replaced);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "http://x/redirect?pickcode=2"
        );
    }

    #[tokio::test]
    async fn prunes_empty_dirs_but_never_the_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("strm");
        let deep = root.join("a/b/c");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(root.join("a/keep.strm"), "x").unwrap();

        let removed = prune_empty_ancestors(&deep, &root, 10).await.unwrap();
        assert_eq!(removed, 2);
        assert!(root.join("a").exists());

        std::fs::remove_file(root.join("a/keep.strm")).unwrap();
        let removed = prune_empty_ancestors(&root.join("a"), &root, 10).await.unwrap();
        assert_eq!(removed, 1);
        assert!(root.exists());
    }

    #[tokio::test]
    async fn prune_depth_is_bounded() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("strm");
        let deep = root.join("a/b/c/d");
        std::fs::create_dir_all(&deep).unwrap();

        assert_eq!(prune_empty_ancestors(&deep, &root, 2).await.unwrap(), 2);
        assert!(root.join("a/b").exists());
        assert!(!root.join("a/b/c").exists());
    }
}
