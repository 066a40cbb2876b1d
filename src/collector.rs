//! Flattens a dropped selection of files and folders into upload candidates.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::source::{ContentHandle, FileSource};

/// One upload candidate: content plus its path inside the drop.
#[derive(Debug, Clone)]
pub struct CollectedFile {
    pub content: ContentHandle,
    pub relative_path: String,
    pub size: u64,
}

impl CollectedFile {
    pub fn new(content: ContentHandle, relative_path: impl Into<String>) -> Self {
        let size = content.len();
        Self {
            content,
            relative_path: relative_path.into(),
            size,
        }
    }

    /// Last segment of the relative path.
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

/// Lists a folder's children, possibly across several calls.
///
/// An empty batch means the folder is exhausted. An `Err` for the whole batch
/// abandons the folder; an `Err` item only skips that one child.
pub trait DirectoryReader: Send {
    fn read_batch(&mut self) -> std::io::Result<Vec<std::io::Result<DroppedEntry>>>;
}

pub enum DroppedEntry {
    File { name: String, content: ContentHandle },
    Directory {
        name: String,
        reader: Box<dyn DirectoryReader>,
    },
}

impl fmt::Debug for DroppedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DroppedEntry::File { name, content } => f
                .debug_struct("File")
                .field("name", name)
                .field("size", &content.len())
                .finish(),
            DroppedEntry::Directory { name, .. } => {
                f.debug_struct("Directory").field("name", name).finish()
            }
        }
    }
}

impl DroppedEntry {
    pub fn name(&self) -> &str {
        match self {
            DroppedEntry::File { name, .. } | DroppedEntry::Directory { name, .. } => name,
        }
    }

    /// Builds an entry for a local file or folder.
    pub fn from_path(path: impl AsRef<Path>, batch_size: usize) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("no file name in {}", path.display()),
                )
            })?;

        if metadata.is_dir() {
            Ok(DroppedEntry::Directory {
                name,
                reader: Box::new(FsDirectoryReader::new(path, batch_size)),
            })
        } else {
            Ok(DroppedEntry::File {
                name,
                content: Arc::new(FileSource::with_size(path, metadata.len())),
            })
        }
    }
}

// --- FILESYSTEM READER ---

/// Reads a local directory one level deep, sorted by name, in fixed-size batches.
pub struct FsDirectoryReader {
    path: PathBuf,
    batch_size: usize,
    listing: Option<std::vec::IntoIter<walkdir::Result<walkdir::DirEntry>>>,
}

impl FsDirectoryReader {
    pub fn new(path: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            path: path.into(),
            batch_size: batch_size.max(1),
            listing: None,
        }
    }

    fn to_entry(&self, entry: walkdir::DirEntry) -> std::io::Result<Option<DroppedEntry>> {
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type();
        if file_type.is_dir() {
            return Ok(Some(DroppedEntry::Directory {
                name,
                reader: Box::new(FsDirectoryReader::new(entry.path(), self.batch_size)),
            }));
        }
        if !file_type.is_file() {
            debug!("Skipping non-regular entry {}", entry.path().display());
            return Ok(None);
        }
        let size = entry
            .metadata()
            .map_err(|e| {
                let e = std::io::Error::from(e);
                std::io::Error::new(e.kind(), format!("{}: {e}", entry.path().display()))
            })?
            .len();
        Ok(Some(DroppedEntry::File {
            name,
            content: Arc::new(FileSource::with_size(entry.path(), size)),
        }))
    }
}

impl DirectoryReader for FsDirectoryReader {
    fn read_batch(&mut self) -> std::io::Result<Vec<std::io::Result<DroppedEntry>>> {
        if self.listing.is_none() {
            let entries: Vec<_> = WalkDir::new(&self.path)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .collect();
            self.listing = Some(entries.into_iter());
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let Some(entry) = self.listing.as_mut().and_then(Iterator::next) else {
                break;
            };
            let entry = entry
                .map_err(std::io::Error::from)
                .and_then(|entry| self.to_entry(entry));
            match entry {
                Ok(Some(entry)) => batch.push(Ok(entry)),
                Ok(None) => {}
                Err(e) => batch.push(Err(e)),
            }
        }
        Ok(batch)
    }
}

// --- TRAVERSAL ---

struct Frame {
    prefix: String,
    reader: Box<dyn DirectoryReader>,
    pending: VecDeque<std::io::Result<DroppedEntry>>,
}

/// Lazy depth-first walk over a selection. One-shot: not restartable.
pub struct CollectedFiles {
    roots: std::vec::IntoIter<DroppedEntry>,
    stack: Vec<Frame>,
}

/// Walks `selection` into `(content, relative path, size)` triples.
///
/// Top-level files keep their bare name; files inside a dropped folder get
/// `folder/.../name`. A folder that fails to list yields one `Err` and is
/// skipped, as does a single unreadable child; the rest of the selection is
/// still produced.
pub fn collect_selection(selection: impl IntoIterator<Item = DroppedEntry>) -> CollectedFiles {
    CollectedFiles {
        roots: selection.into_iter().collect::<Vec<_>>().into_iter(),
        stack: Vec::new(),
    }
}

impl CollectedFiles {
    fn push_dir(&mut self, prefix: String, reader: Box<dyn DirectoryReader>) {
        self.stack.push(Frame {
            prefix,
            reader,
            pending: VecDeque::new(),
        });
    }
}

impl Iterator for CollectedFiles {
    type Item = std::io::Result<CollectedFile>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                match self.roots.next()? {
                    DroppedEntry::File { name, content } => {
                        return Some(Ok(CollectedFile::new(content, name)));
                    }
                    DroppedEntry::Directory { name, reader } => {
                        self.push_dir(name, reader);
                        continue;
                    }
                }
            };

            if let Some(entry) = frame.pending.pop_front() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping entry in {}: {e}", frame.prefix);
                        let message = format!("{}: {e}", frame.prefix);
                        return Some(Err(std::io::Error::new(e.kind(), message)));
                    }
                };
                let path = format!("{}/{}", frame.prefix, entry.name());
                match entry {
                    DroppedEntry::File { content, .. } => {
                        return Some(Ok(CollectedFile::new(content, path)));
                    }
                    DroppedEntry::Directory { reader, .. } => self.push_dir(path, reader),
                }
                continue;
            }

            match frame.reader.read_batch() {
                Ok(batch) if batch.is_empty() => {
                    self.stack.pop();
                }
                Ok(batch) => frame.pending.extend(batch),
                Err(e) => {
                    let prefix = frame.prefix.clone();
                    self.stack.pop();
                    warn!("Failed to read folder {prefix}: {e}");
                    return Some(Err(std::io::Error::new(e.kind(), format!("{prefix}: {e}"))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn mem_file(name: &str, data: &'static [u8]) -> DroppedEntry {
        DroppedEntry::File {
            name: name.into(),
            content: Arc::new(MemorySource::new(data)),
        }
    }

    /// Hands out pre-built batches, then empties forever.
    struct ScriptedReader {
        batches: VecDeque<std::io::Result<Vec<std::io::Result<DroppedEntry>>>>,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl DirectoryReader for ScriptedReader {
        fn read_batch(&mut self) -> std::io::Result<Vec<std::io::Result<DroppedEntry>>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.batches.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn scripted_dir(
        name: &str,
        batches: Vec<std::io::Result<Vec<DroppedEntry>>>,
    ) -> (DroppedEntry, Arc<std::sync::atomic::AtomicUsize>) {
        let batches = batches
            .into_iter()
            .map(|batch| batch.map(|entries| entries.into_iter().map(Ok).collect()))
            .collect();
        scripted_dir_with_items(name, batches)
    }

    fn scripted_dir_with_items(
        name: &str,
        batches: Vec<std::io::Result<Vec<std::io::Result<DroppedEntry>>>>,
    ) -> (DroppedEntry, Arc<std::sync::atomic::AtomicUsize>) {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let entry = DroppedEntry::Directory {
            name: name.into(),
            reader: Box::new(ScriptedReader {
                batches: batches.into_iter().collect(),
                calls: calls.clone(),
            }),
        };
        (entry, calls)
    }

    fn paths(files: CollectedFiles) -> Vec<String> {
        files.map(|f| f.unwrap().relative_path).collect()
    }

    #[test]
    fn plain_file_keeps_its_name() {
        let out = paths(collect_selection(vec![mem_file("report.pdf", b"pdf")]));
        assert_eq!(out, vec!["report.pdf"]);
    }

    #[test]
    fn drains_every_batch_until_empty() {
        let (dir, calls) = scripted_dir(
            "top",
            vec![
                Ok(vec![mem_file("1.txt", b"a"), mem_file("2.txt", b"b")]),
                Ok(vec![mem_file("3.txt", b"c")]),
            ],
        );
        let out = paths(collect_selection(vec![dir]));
        assert_eq!(out, vec!["top/1.txt", "top/2.txt", "top/3.txt"]);
        // two data batches plus the empty one that ends the folder
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn nested_folders_preserve_hierarchy() {
        let (sub, _) = scripted_dir("sub", vec![Ok(vec![mem_file("b.txt", b"b")])]);
        let (top, _) = scripted_dir("top", vec![Ok(vec![mem_file("a.txt", b"a"), sub])]);
        let out = paths(collect_selection(vec![top, mem_file("loose.txt", b"x")]));
        assert_eq!(out, vec!["top/a.txt", "top/sub/b.txt", "loose.txt"]);
    }

    #[test]
    fn failing_folder_is_reported_and_skipped() {
        let broken = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let (bad, _) = scripted_dir("locked", vec![Err(broken)]);
        let results: Vec<_> = collect_selection(vec![bad, mem_file("ok.txt", b"ok")]).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().relative_path, "ok.txt");
    }

    #[test]
    fn unreadable_child_does_not_hide_its_siblings() {
        let broken = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no stat");
        let (dir, _) = scripted_dir_with_items(
            "top",
            vec![
                Ok(vec![Ok(mem_file("a.txt", b"a")), Err(broken), Ok(mem_file("c.txt", b"c"))]),
                Ok(vec![Ok(mem_file("d.txt", b"d"))]),
            ],
        );
        let results: Vec<_> = collect_selection(vec![dir]).collect();
        assert_eq!(results.len(), 4);
        assert!(results[1].is_err());
        let ok: Vec<_> = results
            .into_iter()
            .filter_map(Result::ok)
            .map(|f| f.relative_path)
            .collect();
        assert_eq!(ok, vec!["top/a.txt", "top/c.txt", "top/d.txt"]);
    }

    #[test]
    fn sizes_come_from_content() {
        let files: Vec<_> = collect_selection(vec![mem_file("n.bin", b"12345")])
            .map(Result::unwrap)
            .collect();
        assert_eq!(files[0].size, 5);
        assert_eq!(files[0].file_name(), "n.bin");
    }

    #[test]
    fn filesystem_folder_walk() {
        let dir = tempfile::TempDir::new().unwrap();
        let top = dir.path().join("top");
        std::fs::create_dir_all(top.join("sub")).unwrap();
        std::fs::write(top.join("a.txt"), b"alpha").unwrap();
        std::fs::write(top.join("sub").join("b.txt"), b"beta").unwrap();

        // batch size 1 forces several reads per folder
        let entry = DroppedEntry::from_path(&top, 1).unwrap();
        let files: Vec<_> = collect_selection(vec![entry]).map(Result::unwrap).collect();

        let rel: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rel, vec!["top/a.txt", "top/sub/b.txt"]);
        assert_eq!(files[0].size, 5);
        assert_eq!(files[1].size, 4);
    }
}
