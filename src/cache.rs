//! Campaign-scoped record of addresses that failed verification.
use std::collections::HashSet;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

use log::{debug, warn};
use parking_lot::Mutex;

/// Addresses known not to work in the current campaign.
///
/// Shared by every concurrent probe; entries are only ever added.
#[derive(Debug, Default)]
pub struct FailureCache {
    failed: Mutex<HashSet<IpAddr>>,
}

impl FailureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds addresses remembered by an earlier campaign.
    pub fn extend(&self, known: impl IntoIterator<Item = IpAddr>) {
        self.failed.lock().extend(known);
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.failed.lock().contains(addr)
    }

    /// Returns `true` if the address was not recorded yet.
    pub fn insert(&self, addr: IpAddr) -> bool {
        self.failed.lock().insert(addr)
    }

    pub fn len(&self) -> usize {
        self.failed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.failed.lock().is_empty()
    }

    pub fn snapshot(&self) -> HashSet<IpAddr> {
        self.failed.lock().clone()
    }
}

/// Persists failed addresses between campaigns.
pub trait FailureStore: Send + Sync {
    fn load(&self) -> io::Result<HashSet<IpAddr>>;
    fn save(&self, failed: &HashSet<IpAddr>) -> io::Result<()>;
}

/// Stores one address per line in a plain text file.
#[derive(Debug, Clone)]
pub struct FileFailureStore {
    path: PathBuf,
}

impl FileFailureStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FailureStore for FileFailureStore {
    /// A missing file is an empty set; unparseable lines are skipped.
    fn load(&self) -> io::Result<HashSet<IpAddr>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No failure cache at {}", self.path.display());
                return Ok(HashSet::new());
            }
            Err(e) => return Err(e),
        };

        Ok(content
            .lines()
            .filter_map(|line| match line.trim().parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) if line.trim().is_empty() => None,
                Err(_) => {
                    warn!("Ignoring malformed failure cache entry {line:?}");
                    None
                }
            })
            .collect())
    }

    fn save(&self, failed: &HashSet<IpAddr>) -> io::Result<()> {
        let mut lines: Vec<String> = failed.iter().map(ToString::to_string).collect();
        lines.sort_unstable();
        lines.push(String::new());
        fs::write(&self.path, lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn insert_reports_first_time_only() {
        let cache = FailureCache::new();
        assert!(cache.insert(ip(1)));
        assert!(!cache.insert(ip(1)));
        assert!(cache.contains(&ip(1)));
        assert_eq!(cache.len(), 1);

        cache.extend([ip(1), ip(2), ip(3)]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn concurrent_inserts_are_not_lost() {
        let cache = Arc::new(FailureCache::new());
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..30u8 {
                        cache.insert(IpAddr::V4(Ipv4Addr::new(10, t, 0, i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 240);
    }

    #[test]
    fn file_store_round_trips_and_tolerates_absence() {
        let path = std::env::temp_dir().join(format!("cdnscan-failed-{}.txt", std::process::id()));
        let store = FileFailureStore::new(&path);
        let _ = fs::remove_file(&path);
        assert!(store.load().unwrap().is_empty());

        let failed: HashSet<IpAddr> = [ip(4), ip(9)].into_iter().collect();
        store.save(&failed).unwrap();
        fs::write(&path, format!("{}garbage\n", fs::read_to_string(&path).unwrap())).unwrap();

        let loaded = store.load().unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(loaded, failed);
    }
}
