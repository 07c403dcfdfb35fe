use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::Builder;

use crate::error::GpmError;
use crate::granule::GranuleData;
use crate::query::strip_query;

pub const GRANULE_EXTENSION: &str = "json";

const PATH_MARKERS: [&str; 2] = ["hyrax/", "opendap/"];

/// Writes never replace an existing file.
pub trait GranuleStore: Send + Sync {
    fn exists(&self, path: &Utf8Path) -> bool;
    fn write(&self, path: &Utf8Path, data: &GranuleData) -> Result<(), GpmError>;
}

#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: Utf8PathBuf,
}

impl CacheLayout {
    pub fn new() -> Result<Self, GpmError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("gpmdap")).ok()
            })
            .ok_or_else(|| GpmError::Filesystem("unable to resolve cache directory".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn cache_path_for(&self, url: &str) -> Result<Utf8PathBuf, GpmError> {
        let base = strip_query(url);
        let marker = PATH_MARKERS
            .iter()
            .find(|marker| base.contains(*marker))
            .ok_or_else(|| {
                GpmError::InvalidRequest(format!(
                    "granule URL has no opendap/ or hyrax/ path: {url}"
                ))
            })?;
        let suffix = base
            .split_once(marker)
            .map(|(_, rest)| rest.trim_start_matches('/'))
            .unwrap_or_default();
        if suffix.is_empty() || suffix.split('/').any(|part| part == "..") {
            return Err(GpmError::InvalidRequest(format!(
                "granule URL has no usable file path: {url}"
            )));
        }
        Ok(self.root.join(suffix).with_extension(GRANULE_EXTENSION))
    }

    pub fn ensure_directories<'p>(
        &self,
        paths: impl IntoIterator<Item = &'p Utf8Path>,
    ) -> Result<usize, GpmError> {
        let parents: BTreeSet<&Utf8Path> = paths.into_iter().filter_map(Utf8Path::parent).collect();
        for parent in &parents {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| GpmError::Filesystem(format!("create {parent}: {err}")))?;
        }
        Ok(parents.len())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileGranuleStore;

impl FileGranuleStore {
    pub fn read(&self, path: &Utf8Path) -> Result<GranuleData, GpmError> {
        let content = fs::read(path.as_std_path())
            .map_err(|err| GpmError::Filesystem(format!("read {path}: {err}")))?;
        serde_json::from_slice(&content)
            .map_err(|err| GpmError::Filesystem(format!("decode {path}: {err}")))
    }
}

impl GranuleStore for FileGranuleStore {
    fn exists(&self, path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    fn write(&self, path: &Utf8Path, data: &GranuleData) -> Result<(), GpmError> {
        let parent = path
            .parent()
            .ok_or_else(|| GpmError::Filesystem(format!("invalid cache path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| GpmError::Filesystem(err.to_string()))?;
        let content =
            serde_json::to_vec(data).map_err(|err| GpmError::Filesystem(err.to_string()))?;

        let mut temp = Builder::new()
            .prefix(".gpmdap-granule")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| GpmError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| GpmError::Filesystem(err.to_string()))?;
        match temp.persist_noclobber(path.as_std_path()) {
            Ok(_) => Ok(()),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(GpmError::Filesystem(format!("persist {path}: {}", err.error))),
        }
    }
}

pub mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            values
                .iter()
                .map(|value| (!value.is_nan()).then_some(*value)),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values
            .into_iter()
            .map(|value| value.unwrap_or(f64::NAN))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn cache_paths_follow_server_tree() {
        let layout = CacheLayout::new_with_root(Utf8PathBuf::from("/cache"));
        let path = layout
            .cache_path_for(
                "https://gpm1.gesdisc.eosdis.nasa.gov:443/opendap/hyrax/GPM_L3/GPM_3IMERGHH.06/2020/001/3B-HHR.MS.MRG.3IMERG.20200101-S000000-E002959.0000.V06B.HDF5",
            )
            .unwrap();
        assert_eq!(
            path,
            "/cache/GPM_L3/GPM_3IMERGHH.06/2020/001/3B-HHR.MS.MRG.3IMERG.20200101-S000000-E002959.0000.V06B.json"
        );

        let path = layout
            .cache_path_for("https://host/opendap/GPM_L3/d/f.nc4?precipitationCal[0:1:0]")
            .unwrap();
        assert_eq!(path, "/cache/GPM_L3/d/f.json");
    }

    #[test]
    fn cache_path_requires_marker() {
        let layout = CacheLayout::new_with_root(Utf8PathBuf::from("/cache"));
        assert_matches!(
            layout.cache_path_for("https://host/data/f.HDF5"),
            Err(GpmError::InvalidRequest(_))
        );
    }
}
