//! Dataset registry.
//!
//! A registered path is one dataset; its subdirectories are subjects and
//! their files are images. Listing walks the filesystem on demand, so a
//! dataset refreshed on disk needs no re-registration.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{info, warn};
use wire::DatasetInfo;

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
struct DatasetRoot {
    name: String,
    path: PathBuf,
}

pub struct DatasetRegistry {
    roots: RwLock<Vec<DatasetRoot>>,
}

#[derive(Debug)]
pub struct UnknownDataset(pub String);

impl DatasetRegistry {
    pub fn new(paths: &[PathBuf]) -> Self {
        let registry = Self {
            roots: RwLock::new(Vec::new()),
        };
        registry.register(paths);
        registry
    }

    /// Register dataset roots; unreadable or duplicate paths are skipped.
    pub fn register(&self, paths: &[PathBuf]) -> u64 {
        let mut added = 0;
        let mut roots = self.roots.write();
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                warn!("dataset path {} has no usable name", path.display());
                continue;
            };
            if !path.is_dir() {
                warn!("dataset path {} is not a directory", path.display());
                continue;
            }
            if roots.iter().any(|r| r.name == name) {
                continue;
            }
            info!("registered dataset {name} at {}", path.display());
            roots.push(DatasetRoot {
                name,
                path: path.clone(),
            });
            added += 1;
        }
        added
    }

    fn find(&self, name: &str) -> Result<DatasetRoot, UnknownDataset> {
        self.roots
            .read()
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| UnknownDataset(name.to_string()))
    }

    pub fn list(&self) -> Vec<DatasetInfo> {
        self.roots
            .read()
            .iter()
            .map(|root| {
                let subjects = self.subject_dirs(&root.path);
                let images = subjects
                    .iter()
                    .map(|(_, dir)| self.image_files(dir).len() as u64)
                    .sum();
                DatasetInfo {
                    name: root.name.clone(),
                    path: root.path.display().to_string(),
                    subjects: subjects.len() as u64,
                    images,
                }
            })
            .collect()
    }

    pub fn subjects(&self, name: &str) -> Result<Vec<String>, UnknownDataset> {
        let root = self.find(name)?;
        Ok(self
            .subject_dirs(&root.path)
            .into_iter()
            .map(|(subject, _)| subject)
            .collect())
    }

    pub fn images(&self, name: &str, subject: Option<&str>) -> Result<Vec<String>, UnknownDataset> {
        Ok(self
            .walk(name, subject)?
            .into_iter()
            .map(|(_, path)| path.display().to_string())
            .collect())
    }

    /// (subject, image path) pairs in walk order, for bulk enrollment.
    pub fn walk(
        &self,
        name: &str,
        subject: Option<&str>,
    ) -> Result<Vec<(String, PathBuf)>, UnknownDataset> {
        let root = self.find(name)?;
        let mut out = Vec::new();
        for (subj, dir) in self.subject_dirs(&root.path) {
            if subject.is_some_and(|want| want != subj) {
                continue;
            }
            for image in self.image_files(&dir) {
                out.push((subj.clone(), image));
            }
        }
        Ok(out)
    }

    fn subject_dirs(&self, root: &Path) -> Vec<(String, PathBuf)> {
        let Ok(entries) = std::fs::read_dir(root) else {
            return Vec::new();
        };
        let mut dirs: Vec<(String, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter_map(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| (n.to_string(), p.clone()))
            })
            .collect();
        dirs.sort();
        dirs
    }

    fn image_files(&self, dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaffold(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("eyed-ds-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        for (subject, images) in [("s1", 2), ("s2", 1)] {
            let dir = root.join(subject);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..images {
                std::fs::write(dir.join(format!("{i}.jpg")), b"not-a-real-jpeg").unwrap();
            }
        }
        std::fs::write(root.join("s1").join("notes.txt"), b"ignored").unwrap();
        root
    }

    #[test]
    fn lists_subjects_and_images() {
        let root = scaffold("list");
        let registry = DatasetRegistry::new(&[root.clone()]);

        let datasets = registry.list();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].subjects, 2);
        assert_eq!(datasets[0].images, 3);

        let name = &datasets[0].name;
        assert_eq!(registry.subjects(name).unwrap(), vec!["s1", "s2"]);
        assert_eq!(registry.images(name, Some("s2")).unwrap().len(), 1);
        assert_eq!(registry.walk(name, None).unwrap().len(), 3);

        assert!(registry.subjects("nope").is_err());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let root = scaffold("dup");
        let registry = DatasetRegistry::new(&[root.clone()]);
        assert_eq!(registry.register(&[root.clone()]), 0);
        assert_eq!(registry.list().len(), 1);
        let _ = std::fs::remove_dir_all(&root);
    }
}
