//! # Device Enumeration Module
//!
//! Finds the video capture devices on the system and the frame sizes they offer.
//!
//! Devices are listed from sysfs, each node is then opened and only those advertising video
//! capture are kept. Devices with identical product names are told apart by a numeric suffix,
//! `"Name (1)"`, `"Name (2)"` and so on.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rscam::{Camera, ResolutionInfo};
use v4l::Device;

use crate::capture::Capabilities;
use crate::error::{Error, Result};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Default sysfs directory listing the video4linux nodes.
pub const SYSFS_VIDEO4LINUX: &str = "/sys/class/video4linux";

/// Frame sizes offered for devices reporting a stepwise range.
pub const COMMON_RESOLUTIONS: [(u32, u32); 6] = [
    (1024, 768),
    (1280, 720),
    (1920, 1080),
    (2304, 1296),
    (3840, 2160),
    (4096, 2160),
];

/// Discrete frame sizes smaller than this in either dimension are not offered.
pub const MIN_RESOLUTION: (u32, u32) = (640, 480);

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// A source of capture devices and their frame sizes.
pub trait DeviceCatalog {
    /// All usable capture devices, ordered by device path, with unique display names.
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// The YUYV frame sizes offered by the device at `path`.
    fn resolutions(&self, path: &Path) -> Result<Vec<(u32, u32)>>;
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device node, e.g. `/dev/video0`
    pub path: PathBuf,

    /// Name shown to the user, unique within a listing
    pub name: String,
}

/// Catalog of the devices present on this machine.
#[derive(Debug, Clone)]
pub struct SystemCatalog {
    sysfs: PathBuf,
    dev: PathBuf,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl SystemCatalog {
    pub fn new() -> Self {
        Self {
            sysfs: PathBuf::from(SYSFS_VIDEO4LINUX),
            dev: PathBuf::from("/dev"),
        }
    }

    /// Scan a different sysfs class directory, with device nodes under `dev`.
    pub fn with_roots<P: AsRef<Path>, Q: AsRef<Path>>(sysfs: P, dev: Q) -> Self {
        Self {
            sysfs: sysfs.as_ref().to_path_buf(),
            dev: dev.as_ref().to_path_buf(),
        }
    }

    /// Every node listed in sysfs with its product name, capture capable or not.
    fn nodes(&self) -> Result<Vec<(PathBuf, String)>> {
        if !self.sysfs.exists() {
            return Err(Error::FileNotFound(self.sysfs.clone()));
        }

        let entries = fs::read_dir(&self.sysfs).map_err(|e| Error::DeviceOpenError {
            path: self.sysfs.clone(),
            source: e,
        })?;

        let mut nodes = Vec::new();
        for entry in entries.flatten() {
            let node = entry.file_name();
            let name = match fs::read_to_string(entry.path().join("name")) {
                Ok(n) => n.trim().to_string(),
                Err(e) => {
                    debug!("Skipping {:?}, no name: {}", node, e);
                    continue;
                }
            };
            if name.is_empty() {
                continue;
            }

            nodes.push((self.dev.join(node), name));
        }

        nodes.sort_by(|a, b| device_order(&a.0, &b.0));

        Ok(nodes)
    }
}

impl Default for SystemCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCatalog for SystemCatalog {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let capture: Vec<(PathBuf, String)> = self
            .nodes()?
            .into_iter()
            .filter(|(path, _)| match Device::with_path(path).and_then(|d| d.query_caps()) {
                Ok(caps) => Capabilities::from(caps).capture,
                Err(e) => {
                    warn!("Device {:?} not accessible: {}", path, e);
                    false
                }
            })
            .collect();

        let names: Vec<String> = capture.iter().map(|(_, n)| n.clone()).collect();

        Ok(capture
            .into_iter()
            .zip(unique_display_names(&names))
            .map(|((path, _), name)| DeviceInfo { path, name })
            .collect())
    }

    fn resolutions(&self, path: &Path) -> Result<Vec<(u32, u32)>> {
        let query_error = |reason: String| Error::ResolutionQueryError {
            path: path.to_path_buf(),
            reason,
        };

        let camera =
            Camera::new(&path.to_string_lossy()).map_err(|e| query_error(e.to_string()))?;
        let info = camera
            .resolutions(b"YUYV")
            .map_err(|e| query_error(e.to_string()))?;

        Ok(filter_resolutions(info))
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Give every name which occurs more than once a 1-based `" (n)"` suffix in order of occurrence.
pub fn unique_display_names(names: &[String]) -> Vec<String> {
    let mut totals: HashMap<&str, usize> = HashMap::new();
    for name in names {
        *totals.entry(name.as_str()).or_default() += 1;
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    names
        .iter()
        .map(|name| {
            if totals[name.as_str()] > 1 {
                let n = seen.entry(name.as_str()).or_default();
                *n += 1;
                format!("{} ({})", name, n)
            } else {
                name.clone()
            }
        })
        .collect()
}

/// Frame sizes to offer from what a device reports.
pub fn filter_resolutions(info: ResolutionInfo) -> Vec<(u32, u32)> {
    match info {
        ResolutionInfo::Discretes(sizes) => sizes
            .into_iter()
            .filter(|&(w, h)| w >= MIN_RESOLUTION.0 && h >= MIN_RESOLUTION.1)
            .collect(),
        ResolutionInfo::Stepwise { .. } => COMMON_RESOLUTIONS.to_vec(),
    }
}

/// Parse a `"WxH"` resolution string.
pub fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Order device paths by their trailing number so `video10` follows `video9`.
fn device_order(a: &Path, b: &Path) -> std::cmp::Ordering {
    fn key(p: &Path) -> (String, Option<u32>) {
        let s = p.to_string_lossy();
        let prefix = s.trim_end_matches(|c: char| c.is_ascii_digit());
        (prefix.to_string(), s[prefix.len()..].parse().ok())
    }

    key(a).cmp(&key(b))
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unique_display_names() {
        let names = strings(&["USB Camera", "Other", "USB Camera", "USB Camera"]);

        assert_eq!(
            unique_display_names(&names),
            strings(&["USB Camera (1)", "Other", "USB Camera (2)", "USB Camera (3)"])
        );
        assert!(unique_display_names(&[]).is_empty());
    }

    #[test]
    fn test_filter_resolutions() {
        let discrete =
            ResolutionInfo::Discretes(vec![(320, 240), (640, 480), (800, 400), (1280, 720)]);
        assert_eq!(filter_resolutions(discrete), vec![(640, 480), (1280, 720)]);

        let stepwise = ResolutionInfo::Stepwise {
            min: (16, 16),
            max: (4096, 2160),
            step: (16, 16),
        };
        assert_eq!(filter_resolutions(stepwise), COMMON_RESOLUTIONS.to_vec());
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("1280x720"), Some((1280, 720)));
        assert_eq!(parse_resolution("1280"), None);
        assert_eq!(parse_resolution("axb"), None);
    }

    #[test]
    fn test_device_order() {
        let mut paths = vec![
            PathBuf::from("/dev/video10"),
            PathBuf::from("/dev/video2"),
            PathBuf::from("/dev/video0"),
        ];
        paths.sort_by(|a, b| device_order(a, b));

        assert_eq!(
            paths,
            vec![
                PathBuf::from("/dev/video0"),
                PathBuf::from("/dev/video2"),
                PathBuf::from("/dev/video10"),
            ]
        );
    }

    #[test]
    fn test_missing_sysfs() {
        let catalog = SystemCatalog::with_roots("/nonexistent/video4linux", "/dev");
        assert!(matches!(catalog.devices(), Err(Error::FileNotFound(_))));
    }

    #[test]
    fn test_nodes_from_sysfs() {
        let root = std::env::temp_dir().join(format!("camrot-sysfs-{}", std::process::id()));
        for (node, name) in [("video1", "Cam B\n"), ("video0", "Cam A\n")] {
            fs::create_dir_all(root.join(node)).unwrap();
            fs::write(root.join(node).join("name"), name).unwrap();
        }
        fs::create_dir_all(root.join("video2")).unwrap();

        let catalog = SystemCatalog::with_roots(&root, "/dev");
        let nodes = catalog.nodes().unwrap();
        fs::remove_dir_all(&root).unwrap();

        assert_eq!(
            nodes,
            vec![
                (PathBuf::from("/dev/video0"), "Cam A".to_string()),
                (PathBuf::from("/dev/video1"), "Cam B".to_string()),
            ]
        );
    }
}
