use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(test)]
use parking_lot::Mutex;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::Arc;

use crate::errors::{AppError, AppResult};
use crate::geocoder::Coordinates;
use crate::normalize::AddressKey;
use crate::resolver::ResolutionResult;

const KEY_COLUMN: &str = "clean_address";
const LEGACY_KEY_COLUMN: &str = "location_name";
const CACHE_COLUMNS: [&str; 4] = [KEY_COLUMN, "latitude", "longitude", "precision"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Exact,
    Approximate,
    None,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Exact => "exact",
            Precision::Approximate => "approximate",
            Precision::None => "none",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the resolution cache. Written once per attempted key,
/// including keys the provider could not resolve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    #[serde(rename = "clean_address")]
    pub key: AddressKey,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub precision: Precision,
}

impl CacheEntry {
    pub fn from_resolution(key: AddressKey, result: ResolutionResult) -> Self {
        match result.coordinates {
            Some(point) => Self {
                key,
                latitude: Some(point.latitude),
                longitude: Some(point.longitude),
                precision: result.precision,
            },
            None => Self::unresolved(key),
        }
    }

    pub fn unresolved(key: AddressKey) -> Self {
        Self {
            key,
            latitude: None,
            longitude: None,
            precision: Precision::None,
        }
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates::new(latitude, longitude)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CacheRow {
    #[serde(alias = "location_name")]
    clean_address: String,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    precision: Option<Precision>,
}

impl CacheRow {
    fn into_entry(self) -> Option<CacheEntry> {
        let key = self.clean_address.trim();
        if key.is_empty() {
            return None;
        }
        let key = AddressKey::from_cached(key.to_string());
        let coordinates = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates::new(latitude, longitude)),
            _ => None,
        };
        let precision = match (self.precision, coordinates) {
            (_, None) => Precision::None,
            (Some(Precision::Approximate), Some(_)) => Precision::Approximate,
            (_, Some(_)) => Precision::Exact,
        };
        Some(CacheEntry::from_resolution(
            key,
            ResolutionResult {
                coordinates,
                precision,
            },
        ))
    }
}

/// Append-only CSV store mapping address keys to their last resolution.
pub struct ResolutionCache {
    path: PathBuf,
    #[cfg(test)]
    fault_injector: Option<Arc<TestFaultInjector>>,
}

impl ResolutionCache {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            #[cfg(test)]
            fault_injector: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keys already attempted in earlier runs, resolved or not.
    pub fn load(&self) -> AppResult<HashSet<AddressKey>> {
        Ok(self.load_entries()?.into_keys().collect())
    }

    /// All entries, de-duplicated by key. When a key was written more than
    /// once, the row closest to the end of the file wins.
    pub fn load_entries(&self) -> AppResult<HashMap<AddressKey, CacheEntry>> {
        Ok(self
            .read_entries()?
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect())
    }

    /// Every readable row in file order, duplicates included.
    fn read_entries(&self) -> AppResult<Vec<CacheEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no resolution cache yet");
                return Ok(Vec::new());
            }
            Err(err) => return Err(self.unreadable(err)),
        };

        let mut reader = csv::Reader::from_reader(file);
        let headers = reader.headers().map_err(|err| self.unreadable(err))?.clone();
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Ok(Vec::new());
        }
        if !headers
            .iter()
            .any(|h| h == KEY_COLUMN || h == LEGACY_KEY_COLUMN)
        {
            return Err(self.unreadable(format!(
                "expected a '{KEY_COLUMN}' column, found [{}]",
                headers.iter().collect::<Vec<_>>().join(", ")
            )));
        }

        let mut entries = Vec::new();
        let mut skipped = 0_usize;
        for row in reader.deserialize::<CacheRow>() {
            match row {
                Ok(row) => entries.extend(row.into_entry()),
                Err(err) if err.is_io_error() => return Err(self.unreadable(err)),
                Err(err) => {
                    skipped += 1;
                    debug!(%err, "skipping unreadable cache row");
                }
            }
        }

        if skipped > 0 {
            warn!(
                path = %self.path.display(),
                skipped,
                "resolution cache contains unreadable rows; their keys will be retried"
            );
        }
        Ok(entries)
    }

    /// Header of the file on disk; `None` when the file is missing or empty.
    fn existing_header(&self) -> AppResult<Option<Vec<String>>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        let mut reader = csv::Reader::from_reader(file);
        let header = match reader.headers() {
            Ok(header) => header.iter().map(str::to_string).collect(),
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(_) => Vec::new(),
        };
        Ok(Some(header))
    }

    /// Rewrites a cache with an older or partial header into the current
    /// layout so that appended rows stay readable. A file whose header can't
    /// be read at all is set aside instead.
    fn migrate_layout(&self) -> AppResult<()> {
        let entries = match self.read_entries() {
            Ok(entries) => entries,
            Err(err) if err.is_recoverable() => {
                warn!(%err, "resolution cache header is unusable; starting a new file");
                if let Some(moved) = self.quarantine()? {
                    warn!(path = %moved.display(), "moved unreadable cache aside");
                }
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let staging = self.path.with_extension("csv.migrating");
        {
            let file = File::create(&staging)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&file);
            writer.write_record(CACHE_COLUMNS)?;
            for entry in &entries {
                writer.serialize(entry)?;
            }
            writer.flush()?;
            drop(writer);
            file.sync_data()?;
        }
        fs::rename(&staging, &self.path)?;

        info!(
            path = %self.path.display(),
            count = entries.len(),
            "rewrote resolution cache in the current layout"
        );
        Ok(())
    }

    /// Durably appends `entries`. The header is only written when the file
    /// is missing or empty; a file in an older layout is rewritten first.
    pub fn append(&self, entries: &[CacheEntry]) -> AppResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .map(|hooks| hooks.take_disk_full())
            .unwrap_or(false)
        {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "simulated disk full",
            )));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let needs_header = match self.existing_header()? {
            None => true,
            Some(header) if header == CACHE_COLUMNS => false,
            Some(_) => {
                self.migrate_layout()?;
                false
            }
        };
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        if !needs_header {
            terminate_last_line(&mut file)?;
        }

        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(needs_header)
                .from_writer(&mut file);
            for entry in entries {
                writer.serialize(entry)?;
            }
            writer.flush()?;
        }
        file.sync_data()?;

        info!(
            path = %self.path.display(),
            count = entries.len(),
            "persisted resolution batch"
        );
        Ok(())
    }

    /// Renames an unreadable cache file out of the way so the next append
    /// starts a fresh file with a proper header. The original bytes are
    /// kept next to it for inspection.
    pub fn quarantine(&self) -> AppResult<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let stem = self
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "resolution-cache".to_string());
        let target = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(
                "{stem}-unreadable-{}.csv",
                Utc::now().format("%Y%m%d%H%M%S")
            ));
        fs::rename(&self.path, &target)?;
        Ok(Some(target))
    }

    fn unreadable(&self, reason: impl fmt::Display) -> AppError {
        AppError::CacheUnreadable {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

/// A crash mid-write can leave a row without its newline; make sure the
/// next row starts on a line of its own.
fn terminate_last_line(file: &mut File) -> io::Result<()> {
    if file.metadata()?.len() == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
#[derive(Default)]
pub struct TestFaultInjector {
    disk_full: AtomicBool,
    succeed_before_disk_full: Mutex<Option<usize>>,
}

#[cfg(test)]
impl TestFaultInjector {
    pub fn fail_next_disk_full(&self) {
        self.disk_full.store(true, Ordering::SeqCst);
    }

    /// Lets `appends` batches through, then fails the next one.
    pub fn fail_disk_full_after(&self, appends: usize) {
        *self.succeed_before_disk_full.lock() = Some(appends);
    }

    fn take_disk_full(&self) -> bool {
        if self.disk_full.swap(false, Ordering::SeqCst) {
            return true;
        }
        let mut remaining = self.succeed_before_disk_full.lock();
        match *remaining {
            Some(0) => {
                *remaining = None;
                true
            }
            Some(n) => {
                *remaining = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
impl ResolutionCache {
    pub fn enable_test_hooks(&mut self) -> Arc<TestFaultInjector> {
        let hooks = Arc::new(TestFaultInjector::default());
        self.fault_injector = Some(hooks.clone());
        hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use tempfile::tempdir;

    fn exact(key: &str, latitude: f64, longitude: f64) -> CacheEntry {
        CacheEntry {
            key: normalize(key),
            latitude: Some(latitude),
            longitude: Some(longitude),
            precision: Precision::Exact,
        }
    }

    #[test]
    fn missing_file_is_an_empty_cache() {
        let dir = tempdir().unwrap();
        let cache = ResolutionCache::new(dir.path().join("dim_locations.csv"));
        assert!(cache.load().unwrap().is_empty());
    }

    #[test]
    fn writes_header_once_across_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("processed").join("dim_locations.csv");
        let cache = ResolutionCache::new(&path);

        cache.append(&[exact("jurica", 20.6544, -100.4431)]).unwrap();
        cache
            .append(&[
                CacheEntry {
                    key: normalize("zikura, zibatá"),
                    latitude: Some(20.67),
                    longitude: Some(-100.33),
                    precision: Precision::Approximate,
                },
                CacheEntry::unresolved(normalize("xyznonexistent123")),
            ])
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "clean_address,latitude,longitude,precision",
                "jurica,20.6544,-100.4431,exact",
                "\"zikura, zibatá\",20.67,-100.33,approximate",
                "xyznonexistent123,,,none",
            ]
        );
    }

    #[test]
    fn loads_resolved_and_unresolved_keys() {
        let dir = tempdir().unwrap();
        let cache = ResolutionCache::new(dir.path().join("cache.csv"));
        cache
            .append(&[
                exact("jurica", 20.6544, -100.4431),
                CacheEntry::unresolved(normalize("xyznonexistent123")),
            ])
            .unwrap();

        let keys = cache.load().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("jurica"));
        assert!(keys.contains("xyznonexistent123"));

        let entries = cache.load_entries().unwrap();
        assert_eq!(entries["jurica"], exact("jurica", 20.6544, -100.4431));
        assert_eq!(entries["xyznonexistent123"].coordinates(), None);
    }

    #[test]
    fn accepts_legacy_schema_without_precision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.csv");
        fs::write(
            &path,
            "location_name,latitude,longitude\njurica,20.6544,-100.4431\ncentro sur,,\n",
        )
        .unwrap();

        let entries = ResolutionCache::new(&path).load_entries().unwrap();
        assert_eq!(entries["jurica"].precision, Precision::Exact);
        assert_eq!(entries["centro sur"].precision, Precision::None);
    }

    #[test]
    fn appends_to_older_layouts_stay_readable() {
        for header in [
            "location_name,latitude,longitude",
            "clean_address,latitude,longitude",
        ] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("dim_locations.csv");
            fs::write(&path, format!("{header}\njurica,20.6544,-100.4431\ncentro sur,,\n"))
                .unwrap();
            let cache = ResolutionCache::new(&path);
            assert_eq!(cache.load().unwrap().len(), 2);

            cache
                .append(&[CacheEntry::unresolved(normalize("xyznonexistent123"))])
                .unwrap();

            let keys = cache.load().unwrap();
            assert_eq!(keys.len(), 3, "after appending under '{header}'");
            assert!(keys.contains("xyznonexistent123"));

            let contents = fs::read_to_string(&path).unwrap();
            let lines: Vec<_> = contents.lines().collect();
            assert_eq!(
                lines,
                vec![
                    "clean_address,latitude,longitude,precision",
                    "jurica,20.6544,-100.4431,exact",
                    "centro sur,,,none",
                    "xyznonexistent123,,,none",
                ]
            );
        }
    }

    #[test]
    fn rewriting_an_older_layout_keeps_the_latest_duplicate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.csv");
        fs::write(
            &path,
            "location_name,latitude,longitude\nel refugio,,\nel refugio,20.64,-100.35\n",
        )
        .unwrap();
        let cache = ResolutionCache::new(&path);

        cache.append(&[exact("jurica", 20.6544, -100.4431)]).unwrap();

        let entries = cache.load_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["el refugio"].precision, Precision::Exact);
    }

    #[test]
    fn torn_header_is_replaced_on_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        fs::write(&path, "clean_address,latitude,lon").unwrap();
        let cache = ResolutionCache::new(&path);
        assert!(cache.load().unwrap().is_empty());

        cache.append(&[exact("jurica", 20.6544, -100.4431)]).unwrap();
        cache.append(&[exact("zibatá", 20.67, -100.33)]).unwrap();

        let keys = cache.load().unwrap();
        assert_eq!(keys.len(), 2);
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("clean_address,latitude,longitude,precision\njurica,"));
    }

    #[test]
    fn unusable_header_is_set_aside_on_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        fs::write(&path, "id,name\n1,foo\n").unwrap();
        let cache = ResolutionCache::new(&path);

        cache.append(&[exact("jurica", 20.6544, -100.4431)]).unwrap();

        let keys = cache.load().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("jurica"));
        let set_aside = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains("-unreadable-"))
            .count();
        assert_eq!(set_aside, 1);
    }

    #[test]
    fn later_rows_win_for_duplicate_keys() {
        let dir = tempdir().unwrap();
        let cache = ResolutionCache::new(dir.path().join("cache.csv"));
        cache
            .append(&[CacheEntry::unresolved(normalize("el refugio"))])
            .unwrap();
        cache
            .append(&[exact("el refugio", 20.64, -100.35)])
            .unwrap();

        let entries = cache.load_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["el refugio"].precision, Precision::Exact);
    }

    #[test]
    fn skips_torn_rows_and_repairs_the_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        fs::write(
            &path,
            "clean_address,latitude,longitude,precision\njurica,20.6544,-100.4431,exact\ncentro sur,20.5",
        )
        .unwrap();
        let cache = ResolutionCache::new(&path);

        let keys = cache.load().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("jurica"));

        cache.append(&[exact("milenio iii", 20.59, -100.36)]).unwrap();
        let keys = cache.load().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("milenio iii"));
        assert!(!keys.contains("centro sur"));
    }

    #[test]
    fn foreign_file_is_reported_as_recoverable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        fs::write(&path, "id,name\n1,foo\n").unwrap();

        let err = ResolutionCache::new(&path).load().unwrap_err();
        assert!(matches!(err, AppError::CacheUnreadable { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn quarantine_moves_the_file_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dim_locations.csv");
        fs::write(&path, "id,name\n1,foo\n").unwrap();
        let cache = ResolutionCache::new(&path);

        let moved = cache.quarantine().unwrap().unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_to_string(&moved).unwrap(), "id,name\n1,foo\n");
        assert!(moved
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("dim_locations-unreadable-"));
        assert!(cache.load().unwrap().is_empty());
        assert_eq!(cache.quarantine().unwrap(), None);
    }

    #[test]
    fn empty_file_gets_a_header_on_first_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.csv");
        File::create(&path).unwrap();
        let cache = ResolutionCache::new(&path);
        assert!(cache.load().unwrap().is_empty());

        cache.append(&[exact("jurica", 20.6544, -100.4431)]).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("clean_address,latitude,longitude,precision\n"));
    }

    #[test]
    fn failed_append_leaves_previous_batches_intact() {
        let dir = tempdir().unwrap();
        let mut cache = ResolutionCache::new(dir.path().join("cache.csv"));
        let hooks = cache.enable_test_hooks();

        cache.append(&[exact("jurica", 20.6544, -100.4431)]).unwrap();
        hooks.fail_next_disk_full();
        let result = cache.append(&[exact("zibatá", 20.67, -100.33)]);
        assert!(matches!(result, Err(AppError::Io(_))));

        let keys = cache.load().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("jurica"));
    }
}
