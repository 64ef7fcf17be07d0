//! # Control Surface Module
//!
//! [`Controller`] is the control-process side of the system. It keeps the selected source,
//! resolution, backend and angle, launches and stops the renderer process, and sends angle
//! updates over the channel while the renderer runs.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::angle::Angle;
use crate::backend::BackendKind;
use crate::channel::{AngleSender, MessageSink};
use crate::devices::{DeviceCatalog, DeviceInfo};
use crate::error::{Error, Result};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Time the renderer gets to exit after SIGTERM before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(3);

const STOP_POLL: Duration = Duration::from_millis(20);

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

pub struct Controller<C: DeviceCatalog, S: MessageSink> {
    catalog: C,
    sender: AngleSender<S>,
    renderer: PathBuf,
    stop_grace: Duration,

    devices: Vec<DeviceInfo>,
    resolutions: Vec<(u32, u32)>,

    source: Option<DeviceInfo>,
    resolution: Option<(u32, u32)>,
    backend: BackendKind,
    angle: Angle,

    playing: bool,
    child: Option<Child>,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl<C: DeviceCatalog, S: MessageSink> Controller<C, S> {
    /// Create a controller, listing devices and selecting the first one.
    ///
    /// `renderer` is the executable launched by [`Controller::play`].
    pub fn new<P: AsRef<Path>>(catalog: C, sink: S, renderer: P) -> Self {
        let mut controller = Self {
            catalog,
            sender: AngleSender::new(sink),
            renderer: renderer.as_ref().to_path_buf(),
            stop_grace: STOP_GRACE,
            devices: Vec::new(),
            resolutions: Vec::new(),
            source: None,
            resolution: None,
            backend: BackendKind::default(),
            angle: Angle::wrapping(0),
            playing: false,
            child: None,
        };

        match controller.catalog.devices() {
            Ok(devices) => controller.devices = devices,
            Err(e) => warn!("Cannot list video devices: {}", e),
        }

        match controller.devices.first().map(|d| d.name.clone()) {
            Some(name) => controller.set_source(&name),
            None => warn!("No video devices found"),
        }

        controller
    }

    /// Set how long the renderer gets to exit after SIGTERM.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn resolutions(&self) -> &[(u32, u32)] {
        &self.resolutions
    }

    pub fn source(&self) -> Option<&DeviceInfo> {
        self.source.as_ref()
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn angle(&self) -> i32 {
        self.angle.degrees()
    }

    /// Whether a source is selected, angle changes are only sent once one is.
    pub fn is_initialized(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Select the source with the given display name.
    ///
    /// An unknown name is logged and leaves the selection unchanged. Otherwise the resolution
    /// list is refreshed and the first entry selected.
    pub fn set_source(&mut self, name: &str) {
        let device = match self.devices.iter().find(|d| d.name == name) {
            Some(d) => d.clone(),
            None => {
                warn!("Could not find a device path for source {:?}", name);
                return;
            }
        };

        self.select(device);
    }

    /// Select a source by device path, whether listed or not.
    pub fn set_source_path<P: AsRef<Path>>(&mut self, path: P) {
        let path = path.as_ref().to_path_buf();
        let device = match self.devices.iter().find(|d| d.path == path) {
            Some(d) => d.clone(),
            None => DeviceInfo {
                name: path.display().to_string(),
                path,
            },
        };

        self.select(device);
    }

    pub fn set_resolution(&mut self, resolution: (u32, u32)) {
        debug!("Resolution set to {}x{}", resolution.0, resolution.1);
        self.resolution = Some(resolution);
    }

    pub fn set_backend(&mut self, backend: BackendKind) {
        debug!("Backend set to {}", backend);
        self.backend = backend;
    }

    /// Set the angle, only `0..=359` is accepted.
    ///
    /// # Returns
    /// - `true` if the angle was changed
    pub fn set_angle(&mut self, degrees: i32) -> bool {
        match Angle::new(degrees) {
            Some(a) => {
                self.angle = a;
                true
            }
            None => false,
        }
    }

    /// Turn one degree further and send the new angle.
    pub fn increment(&mut self) -> Result<()> {
        self.angle = self.angle.increment();
        self.send_angle()
    }

    /// Turn one degree back and send the new angle.
    pub fn decrement(&mut self) -> Result<()> {
        self.angle = self.angle.decrement();
        self.send_angle()
    }

    /// Turn through `updates` updates of `step` degrees, pausing `interval` after each.
    ///
    /// A failed send only drops that update, the angle keeps advancing. Returns how many sends
    /// failed.
    pub fn spin(&mut self, step: u32, updates: u32, interval: Duration) -> u32 {
        let mut failed = 0;

        for _ in 0..updates {
            for _ in 0..step.max(1) {
                if let Err(e) = self.increment() {
                    debug!("Spin update to {}° dropped: {}", self.angle.degrees(), e);
                    failed += 1;
                }
            }
            thread::sleep(interval);
        }

        failed
    }

    /// Launch the renderer with the current settings.
    pub fn play(&mut self) -> Result<()> {
        let device = match &self.source {
            Some(d) => d.path.clone(),
            None => {
                warn!("No source selected, cannot play");
                return Ok(());
            }
        };
        if self.renderer_running() {
            warn!("Renderer already running");
            return Ok(());
        }

        let (width, height) = self.resolution.ok_or_else(|| {
            Error::LaunchError(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no resolution selected",
            ))
        })?;

        let args = self.renderer_args(&device, width, height);
        info!("Launching {:?} {}", self.renderer, args.join(" "));

        let child = Command::new(&self.renderer)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(Error::LaunchError)?;

        self.child = Some(child);
        self.playing = true;

        Ok(())
    }

    /// Mark playback paused, the renderer keeps running.
    pub fn pause(&mut self) {
        if self.is_initialized() && self.playing {
            self.playing = false;
            debug!("Paused");
        }
    }

    /// Terminate the renderer and reset the angle to 0.
    pub fn stop(&mut self) -> Result<()> {
        let result = match self.child.take() {
            Some(child) => terminate(child, self.stop_grace),
            None => Ok(()),
        };

        self.playing = false;
        self.angle = Angle::wrapping(0);

        result
    }

    /// Whether a launched renderer is still running.
    pub fn renderer_running(&mut self) -> bool {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!("Renderer exited with {}", status);
                self.child = None;
                false
            }
            Some(Err(e)) => {
                warn!("Cannot query the renderer: {}", e);
                false
            }
            None => false,
        }
    }

    fn select(&mut self, device: DeviceInfo) {
        debug!("Source set to {} at {:?}", device.name, device.path);

        self.resolutions = match self.catalog.resolutions(&device.path) {
            Ok(r) => r,
            Err(e) => {
                warn!("{}", e);
                Vec::new()
            }
        };
        if let Some(first) = self.resolutions.first() {
            self.resolution = Some(*first);
        }

        self.source = Some(device);
    }

    fn send_angle(&mut self) -> Result<()> {
        if !self.is_initialized() {
            return Ok(());
        }

        debug!(
            "Sending angle {} ({:.3} rad)",
            self.angle.degrees(),
            self.angle.radians()
        );
        self.sender.send(self.angle.degrees())?;

        Ok(())
    }

    fn renderer_args(&self, device: &Path, width: u32, height: u32) -> Vec<String> {
        vec![
            device.display().to_string(),
            width.to_string(),
            height.to_string(),
            self.angle.degrees().to_string(),
            String::from("--backend"),
            self.backend.to_string(),
        ]
    }
}

impl<C: DeviceCatalog, S: MessageSink> Drop for Controller<C, S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{}", e);
        }
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// SIGTERM the child, wait up to `grace` for it to exit, then kill it.
fn terminate(mut child: Child, grace: Duration) -> Result<()> {
    if child.try_wait().map_err(Error::LaunchError)?.is_some() {
        return Ok(());
    }

    // SAFETY: the pid belongs to a child which has not been reaped yet
    if unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) } != 0 {
        warn!("Cannot signal the renderer: {}", io::Error::last_os_error());
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().map_err(Error::LaunchError)? {
            info!("Renderer stopped with {}", status);
            return Ok(());
        }
        thread::sleep(STOP_POLL);
    }

    warn!("Renderer did not stop within {:?}, killing it", grace);
    child.kill().map_err(Error::LaunchError)?;
    child.wait().map_err(Error::LaunchError)?;

    Ok(())
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::channel::{memory_channel, AngleMessage, MemorySink, MemorySource, MessageSource};
    use crate::devices::unique_display_names;
    use std::os::unix::fs::PermissionsExt;

    struct FakeCatalog {
        names: Vec<String>,
    }

    impl DeviceCatalog for FakeCatalog {
        fn devices(&self) -> Result<Vec<DeviceInfo>> {
            Ok(unique_display_names(&self.names)
                .into_iter()
                .enumerate()
                .map(|(i, name)| DeviceInfo {
                    path: PathBuf::from(format!("/dev/video{}", i)),
                    name,
                })
                .collect())
        }

        fn resolutions(&self, path: &Path) -> Result<Vec<(u32, u32)>> {
            if path == Path::new("/dev/video0") {
                Ok(vec![(640, 480), (1280, 720)])
            } else {
                Ok(vec![(1920, 1080)])
            }
        }
    }

    fn controller(names: &[&str]) -> (Controller<FakeCatalog, MemorySink>, MemorySource) {
        let (sink, source) = memory_channel(10, 256);
        let catalog = FakeCatalog {
            names: names.iter().map(|s| s.to_string()).collect(),
        };

        (Controller::new(catalog, sink, "true"), source)
    }

    fn next_angle(source: &mut MemorySource) -> AngleMessage {
        AngleMessage::decode(&source.receive().unwrap()).unwrap()
    }

    #[test]
    fn test_spin_survives_full_channel() {
        let (mut c, mut rx) = controller(&["Cam"]);

        // Nothing drains the channel, the last two updates do not fit
        assert_eq!(c.spin(1, 12, Duration::ZERO), 2);
        assert_eq!(c.angle(), 12);

        for expected in 1..=10 {
            assert_eq!(next_angle(&mut rx), AngleMessage::Angle(expected));
        }

        assert!(c.increment().is_ok());
        assert_eq!(next_angle(&mut rx), AngleMessage::Angle(13));
    }

    #[test]
    fn test_default_source() {
        let (c, _rx) = controller(&["Cam", "Cam"]);

        assert_eq!(c.source().map(|d| d.name.as_str()), Some("Cam (1)"));
        assert_eq!(c.resolution(), Some((640, 480)));
        assert_eq!(c.resolutions().len(), 2);
    }

    #[test]
    fn test_set_source() {
        let (mut c, _rx) = controller(&["Cam", "Cam"]);

        c.set_source("Cam (2)");
        assert_eq!(
            c.source().map(|d| d.path.clone()),
            Some(PathBuf::from("/dev/video1"))
        );
        assert_eq!(c.resolution(), Some((1920, 1080)));

        c.set_source("Missing");
        assert_eq!(c.source().map(|d| d.name.as_str()), Some("Cam (2)"));
    }

    #[test]
    fn test_set_angle() {
        let (mut c, _rx) = controller(&["Cam"]);

        assert!(c.set_angle(359));
        assert!(!c.set_angle(360));
        assert!(!c.set_angle(-1));
        assert_eq!(c.angle(), 359);
    }

    #[test]
    fn test_increment_sends_and_wraps() {
        let (mut c, mut rx) = controller(&["Cam"]);

        c.set_angle(359);
        c.increment().unwrap();
        assert_eq!(c.angle(), 0);
        assert_eq!(next_angle(&mut rx), AngleMessage::Angle(0));

        c.decrement().unwrap();
        assert_eq!(c.angle(), 359);
        assert_eq!(next_angle(&mut rx), AngleMessage::Angle(359));
    }

    #[test]
    fn test_uninitialised_does_not_send() {
        let (mut c, _rx) = controller(&[]);
        assert!(!c.is_initialized());

        for _ in 0..20 {
            c.increment().unwrap();
        }
        assert_eq!(c.angle(), 20);

        c.play().unwrap();
        assert!(!c.is_playing());
    }

    #[test]
    fn test_renderer_args() {
        let (mut c, _rx) = controller(&["Cam"]);
        c.set_angle(45);
        c.set_backend(BackendKind::Affine);

        assert_eq!(
            c.renderer_args(Path::new("/dev/video0"), 640, 480),
            vec!["/dev/video0", "640", "480", "45", "--backend", "affine"]
        );
    }

    #[test]
    fn test_play_pause_stop() {
        let script = std::env::temp_dir()
            .join(format!("camrot-renderer-{}.sh", std::process::id()));
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (sink, _rx) = memory_channel(10, 256);
        let catalog = FakeCatalog {
            names: vec![String::from("Cam")],
        };
        let mut c =
            Controller::new(catalog, sink, &script).with_stop_grace(Duration::from_secs(2));

        c.set_angle(10);
        c.play().unwrap();
        assert!(c.is_playing());
        assert!(c.renderer_running());

        c.pause();
        assert!(!c.is_playing());
        assert!(c.renderer_running());

        c.stop().unwrap();
        std::fs::remove_file(&script).unwrap();

        assert!(!c.renderer_running());
        assert_eq!(c.angle(), 0);
    }
}
