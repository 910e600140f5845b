use crate::backup::digest::Digest;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use crate::backup::source::{modified_time, ItemSource, SourceItem};
use crate::backup::validate::validate_source_roots;

use bon::Builder;
use derive_more::{Display, From};
use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use validator::Validate;
use walkdir::{DirEntry, WalkDir};

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt::Formatter;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::result;

/// Directory trees (or single files) walked in path order.
///
/// With one root, archive paths are relative to that root. With several,
/// each root's items are placed under the root's base name.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct FilesSource {
    #[validate(custom(function = validate_source_roots))]
    #[builder(into)]
    paths: Vec<PathBuf>,
    #[serde(default)]
    #[builder(default, into)]
    exclude: Vec<ExcludePattern>,
    #[serde(default = "default_follow_symlinks")]
    #[builder(default = default_follow_symlinks())]
    follow_symlinks: bool,
}

fn default_follow_symlinks() -> bool {
    true
}

/// A glob that never matches across `/` unless it says `**`
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct ExcludePattern {
    glob: Glob,
}

impl ExcludePattern {
    pub fn new(pattern: &str) -> result::Result<Self, globset::Error> {
        GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map(ExcludePattern::from)
    }
}

struct ExcludePatternVisitor;

impl Visitor<'_> for ExcludePatternVisitor {
    type Value = ExcludePattern;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        ExcludePattern::new(v).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for ExcludePattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(ExcludePatternVisitor)
    }
}

/// Matches an archive path against the exclude globs, trying both the whole
/// relative path and its final component.
#[derive(Clone, Debug)]
pub struct ExcludeMatcher {
    globset: GlobSet,
}

impl ExcludeMatcher {
    pub fn empty() -> Self {
        Self {
            globset: GlobSet::empty(),
        }
    }

    pub fn is_excluded<P: AsRef<Path>>(&self, archive_path: P) -> bool {
        let archive_path = archive_path.as_ref();
        if self.globset.is_empty() || archive_path.as_os_str().is_empty() {
            return false;
        }
        self.globset.is_match(archive_path)
            || archive_path
                .file_name()
                .is_some_and(|name| self.globset.is_match(name))
    }
}

#[derive(Clone, Debug)]
struct Root {
    path: PathBuf,
    prefix: PathBuf,
}

impl Root {
    fn archive_path(&self, entry_path: &Path) -> PathBuf {
        let relative = entry_path.strip_prefix(&self.path).unwrap_or(entry_path);
        if relative.as_os_str().is_empty() {
            self.prefix.clone()
        } else {
            self.prefix.join(relative)
        }
    }
}

impl FilesSource {
    pub fn exclude_matcher(&self) -> Result<ExcludeMatcher> {
        let mut builder = GlobSetBuilder::new();
        self.exclude.iter().for_each(|p| {
            builder.add(p.glob.clone());
        });
        Ok(ExcludeMatcher {
            globset: builder.build()?,
        })
    }

    fn roots(&self) -> Result<Vec<Root>> {
        let prefixed = self.paths.len() > 1;
        let mut roots = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let metadata =
                std::fs::metadata(path).map_err(|e| Error::source_unreadable(path, e.into()))?;
            if metadata.is_dir() {
                std::fs::read_dir(path).map_err(|e| Error::source_unreadable(path, e.into()))?;
            } else {
                File::open(path).map_err(|e| Error::source_unreadable(path, e.into()))?;
            }

            let prefix = if prefixed || !metadata.is_dir() {
                path.file_name().map(PathBuf::from).ok_or_else(|| {
                    Error::InvalidConfig(format!("source path {path:?} has no base name"))
                })?
            } else {
                PathBuf::new()
            };
            roots.push(Root {
                path: path.clone(),
                prefix,
            });
        }
        roots.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        Ok(roots)
    }
}

impl ItemSource for FilesSource {
    #[named]
    fn items<'a>(&self) -> Result<DynIter<'a, Result<SourceItem>>> {
        let roots = self.roots()?;
        let matcher = self.exclude_matcher()?;
        tracing::info!(
            "Enumerating {} root(s) with {} exclude pattern(s)",
            roots.len(),
            self.exclude.len()
        );

        let follow_symlinks = self.follow_symlinks;
        let visited_dirs = Rc::new(RefCell::new(HashSet::new()));
        let items = roots
            .into_iter()
            .flat_map(move |root| {
                walk_root(root, matcher.clone(), follow_symlinks, visited_dirs.clone())
            })
            .map(move |res| res.add_fn_name(function_path!()));

        Ok(items.into_dyn_iter())
    }
}

fn walk_root(
    root: Root,
    matcher: ExcludeMatcher,
    follow_symlinks: bool,
    visited_dirs: Rc<RefCell<HashSet<PathBuf>>>,
) -> impl Iterator<Item = Result<SourceItem>> {
    tracing::debug!("Walking {:?}", root.path);
    let filter_root = root.clone();
    WalkDir::new(&root.path)
        .follow_links(follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            if entry.depth() > 0 && matcher.is_excluded(filter_root.archive_path(entry.path())) {
                tracing::debug!("Excluded {:?}", entry.path());
                return false;
            }
            if !entry.file_type().is_dir() {
                return true;
            }
            match entry.path().canonicalize() {
                Ok(canonical) => {
                    let first_visit = visited_dirs.borrow_mut().insert(canonical);
                    if !first_visit {
                        tracing::debug!("Directory {:?} already visited", entry.path());
                    }
                    first_visit
                }
                Err(_) => true,
            }
        })
        .filter_map(move |res| match res {
            Ok(entry) => process_dir_entry(entry, &root),
            Err(e) if e.loop_ancestor().is_some() => {
                tracing::debug!("Skipping symlink loop at {:?}", e.path());
                None
            }
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                tracing::warn!("Cannot read {:?}: {}", path, e);
                let item = root.archive_path(&path);
                Some(Err(Error::item_unreadable(path, item, e.into())))
            }
        })
}

fn process_dir_entry(entry: DirEntry, root: &Root) -> Option<Result<SourceItem>> {
    let file_type = entry.file_type();
    if file_type.is_dir() {
        return None;
    }
    if file_type.is_symlink() {
        tracing::debug!("Not following symlink {:?}", entry.path());
        return None;
    }
    if !file_type.is_file() {
        tracing::debug!("Skipping special file {:?}", entry.path());
        return None;
    }

    let archive_path = root.archive_path(entry.path());
    Some(fingerprint_file(entry.path(), &archive_path).map(|(fingerprint, size, modified)| {
        tracing::trace!("Enumerated {:?} ({} bytes)", archive_path, size);
        SourceItem::from_path(
            archive_path,
            size,
            modified,
            fingerprint,
            entry.path().to_path_buf(),
        )
    }))
}

fn fingerprint_file(
    path: &Path,
    archive_path: &Path,
) -> Result<(Digest, u64, chrono::DateTime<chrono::Utc>)> {
    let read = || -> Result<_> {
        let file = File::open(path)?;
        let modified = modified_time(&file.metadata()?);
        let (fingerprint, size) = Digest::of_reader(file)?;
        Ok((fingerprint, size, modified))
    };
    read().map_err(|e| {
        tracing::warn!("Cannot read {:?}: {}", path, e);
        Error::item_unreadable(path, archive_path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use tempfile::TempDir;

    fn create_test_files(base: &Path) {
        std::fs::create_dir_all(base.join("dir1/nested")).unwrap();
        std::fs::create_dir_all(base.join("cache")).unwrap();
        std::fs::write(base.join("b.txt"), "b").unwrap();
        std::fs::write(base.join("a.txt"), "a").unwrap();
        std::fs::write(base.join("a.swp"), "swap").unwrap();
        std::fs::write(base.join("dir1/z.txt"), "z").unwrap();
        std::fs::write(base.join("dir1/nested/deep.txt"), "deep").unwrap();
        std::fs::write(base.join("cache/blob"), "blob").unwrap();
    }

    fn paths_of(source: &FilesSource) -> Vec<PathBuf> {
        source
            .items()
            .unwrap()
            .map(|r| r.unwrap().path().clone())
            .collect_vec()
    }

    #[test]
    fn test_enumeration_is_ordered_and_repeatable() {
        let temp_dir = TempDir::new().unwrap();
        create_test_files(temp_dir.path());

        let source = FilesSource::builder()
            .paths(vec![temp_dir.path().to_path_buf()])
            .build();
        let first = paths_of(&source);
        assert_eq!(
            first,
            vec![
                PathBuf::from("a.swp"),
                PathBuf::from("a.txt"),
                PathBuf::from("b.txt"),
                PathBuf::from("cache/blob"),
                PathBuf::from("dir1/nested/deep.txt"),
                PathBuf::from("dir1/z.txt"),
            ]
        );
        assert_eq!(first, paths_of(&source));
    }

    #[test]
    fn test_excludes_match_base_name_and_subtree() {
        let temp_dir = TempDir::new().unwrap();
        create_test_files(temp_dir.path());

        let source = FilesSource::builder()
            .paths(vec![temp_dir.path().to_path_buf()])
            .exclude(vec![
                ExcludePattern::new("*.swp").unwrap(),
                ExcludePattern::new("cache").unwrap(),
                ExcludePattern::new("dir1/nested").unwrap(),
            ])
            .build();
        assert_eq!(
            paths_of(&source),
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b.txt"),
                PathBuf::from("dir1/z.txt"),
            ]
        );
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("f"), "one").unwrap();
        let source = FilesSource::builder()
            .paths(vec![temp_dir.path().to_path_buf()])
            .build();

        let before = source.items().unwrap().next().unwrap().unwrap();
        std::fs::write(temp_dir.path().join("f"), "two").unwrap();
        let after = source.items().unwrap().next().unwrap().unwrap();
        assert_ne!(before.fingerprint(), after.fingerprint());
        assert_eq!(before.fingerprint(), &Digest::of_bytes("one"));
    }

    #[test]
    fn test_multiple_roots_are_prefixed() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("etc")).unwrap();
        std::fs::create_dir_all(temp_dir.path().join("home")).unwrap();
        std::fs::write(temp_dir.path().join("etc/hosts"), "h").unwrap();
        std::fs::write(temp_dir.path().join("home/profile"), "p").unwrap();
        std::fs::write(temp_dir.path().join("single.conf"), "s").unwrap();

        let source = FilesSource::builder()
            .paths(vec![
                temp_dir.path().join("home"),
                temp_dir.path().join("single.conf"),
                temp_dir.path().join("etc"),
            ])
            .build();
        assert_eq!(
            paths_of(&source),
            vec![
                PathBuf::from("etc/hosts"),
                PathBuf::from("home/profile"),
                PathBuf::from("single.conf"),
            ]
        );
    }

    #[test]
    fn test_missing_root_is_source_unreadable() {
        let source = FilesSource::builder()
            .paths(vec![PathBuf::from("/nonexistent/directory")])
            .build();
        let error = source.items().err().unwrap();
        assert_eq!(
            error.kind(),
            crate::backup::result_error::error::FailureKind::SourceUnreadable
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_terminates() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();
        std::fs::create_dir_all(base.join("a/b")).unwrap();
        std::fs::write(base.join("a/file"), "f").unwrap();
        std::fs::write(base.join("a/b/inner"), "i").unwrap();
        std::os::unix::fs::symlink(base.join("a"), base.join("a/b/loop")).unwrap();
        std::os::unix::fs::symlink(base.join("a/b"), base.join("alias")).unwrap();

        let source = FilesSource::builder().paths(vec![base.to_path_buf()]).build();
        let paths = paths_of(&source);
        assert_eq!(
            paths,
            vec![PathBuf::from("a/b/inner"), PathBuf::from("a/file")]
        );
    }

    #[test]
    fn test_exclude_pattern_deserialize() {
        let patterns: Vec<ExcludePattern> = serde_json::from_str(r#"["*.log", "tmp/**"]"#).unwrap();
        assert_eq!(patterns.len(), 2);
        assert!(serde_json::from_str::<Vec<ExcludePattern>>(r#"["a[b"]"#).is_err());
    }

    #[test]
    fn test_exclude_matcher_literal_separator() {
        let source = FilesSource::builder()
            .paths(vec![PathBuf::from("/")])
            .exclude(vec![ExcludePattern::new("*.log").unwrap()])
            .build();
        let matcher = source.exclude_matcher().unwrap();
        assert!(matcher.is_excluded("app.log"));
        assert!(matcher.is_excluded("var/app.log"));
        assert!(!matcher.is_excluded("var/app.txt"));
        assert!(!ExcludeMatcher::empty().is_excluded("anything"));
    }
}
