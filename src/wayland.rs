//! # Wayland Surface Module
//!
//! [`WaylandSurface`] presents frames in an xdg toplevel window. Frames are copied into one of
//! two `wl_shm` ARGB8888 buffers sharing a single memfd pool. A buffer is only written again
//! once the compositor has released it.
//!
//! Protocol events are routed to the [`WindowState`] handler, a left click on the window starts
//! an interactive move and the close button ends the pipeline.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use image::RgbaImage;
use log::{debug, info, warn};
use wayland_client::backend::WaylandError;
use wayland_client::protocol::{
    wl_buffer, wl_compositor, wl_pointer, wl_registry, wl_seat, wl_shm, wl_shm_pool, wl_surface,
};
use wayland_client::{delegate_noop, Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

use crate::error::{Error, Result};
use crate::surface::{
    Presentation, PresentationSurface, SurfaceEvents, WindowRequest, WindowState, SLOT_COUNT,
};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Objects bound from the registry, plus the event handler.
struct WaylandState {
    window: WindowState,
    compositor: Option<wl_compositor::WlCompositor>,
    shm: Option<wl_shm::WlShm>,
    wm_base: Option<xdg_wm_base::XdgWmBase>,
    seat: Option<wl_seat::WlSeat>,
    pointer: Option<wl_pointer::WlPointer>,
    toplevel: Option<xdg_toplevel::XdgToplevel>,
}

/// The shared memory pool and the buffers carved out of it.
struct ShmBuffers {
    _fd: OwnedFd,
    map: *mut libc::c_void,
    len: usize,
    frame_len: usize,
    pool: wl_shm_pool::WlShmPool,
    buffers: Vec<wl_buffer::WlBuffer>,
}

pub struct WaylandSurface {
    connection: Connection,
    queue: EventQueue<WaylandState>,
    state: WaylandState,
    surface: wl_surface::WlSurface,
    xdg_surface: xdg_surface::XdgSurface,
    shm: ShmBuffers,
    width: u32,
    height: u32,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl WaylandSurface {
    /// Connect to the display named by the environment and open a `width` x `height` window.
    pub fn connect(width: u32, height: u32, title: &str) -> Result<Self> {
        let connection = Connection::connect_to_env()
            .map_err(|e| presentation_err("cannot connect to the Wayland display", e))?;
        let mut queue = connection.new_event_queue();
        let qh = queue.handle();

        let mut state = WaylandState {
            window: WindowState::new(),
            compositor: None,
            shm: None,
            wm_base: None,
            seat: None,
            pointer: None,
            toplevel: None,
        };

        connection.display().get_registry(&qh, ());
        queue
            .roundtrip(&mut state)
            .map_err(|e| presentation_err("registry roundtrip failed", e))?;

        let compositor = state
            .compositor
            .clone()
            .ok_or_else(|| missing_global("wl_compositor"))?;
        let shm = state.shm.clone().ok_or_else(|| missing_global("wl_shm"))?;
        let wm_base = state
            .wm_base
            .clone()
            .ok_or_else(|| missing_global("xdg_wm_base"))?;
        if state.seat.is_none() {
            warn!("No wl_seat offered, the window cannot be moved");
        }

        let surface = compositor.create_surface(&qh, ());
        let xdg_surface = wm_base.get_xdg_surface(&surface, &qh, ());
        let toplevel = xdg_surface.get_toplevel(&qh, ());
        toplevel.set_title(title.to_string());
        toplevel.set_app_id(String::from("camrot"));
        surface.commit();
        state.toplevel = Some(toplevel);

        let shm = ShmBuffers::new(&shm, width, height, &qh)?;

        queue
            .roundtrip(&mut state)
            .map_err(|e| presentation_err("configure roundtrip failed", e))?;

        info!("Opened {}x{} Wayland window {:?}", width, height, title);

        Ok(Self {
            connection,
            queue,
            state,
            surface,
            xdg_surface,
            shm,
            width,
            height,
        })
    }

    fn flush(&self) -> Result<()> {
        self.connection
            .flush()
            .map_err(|e| presentation_err("flush failed", e))
    }
}

impl PresentationSurface for WaylandSurface {
    fn dispatch(&mut self) -> Result<()> {
        self.flush()?;
        self.queue
            .dispatch_pending(&mut self.state)
            .map_err(|e| presentation_err("dispatch failed", e))?;

        // Read whatever is waiting on the socket without blocking
        if let Some(guard) = self.queue.prepare_read() {
            let mut pfd = libc::pollfd {
                fd: guard.connection_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };

            if unsafe { libc::poll(&mut pfd, 1, 0) } > 0 {
                match guard.read() {
                    Ok(_) => (),
                    Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => (),
                    Err(e) => return Err(presentation_err("read failed", e)),
                }
            }
        }

        self.queue
            .dispatch_pending(&mut self.state)
            .map_err(|e| presentation_err("dispatch failed", e))?;

        Ok(())
    }

    fn present(&mut self, frame: &RgbaImage) -> Result<Presentation> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(Error::PresentationError(format!(
                "frame is {}x{}, surface is {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let slot = match self.state.window.begin_frame() {
            Some(s) => s,
            None => return Ok(Presentation::Dropped),
        };

        // ARGB8888 is little endian, so bytes are stored B, G, R, A
        let dst = self.shm.slot_mut(slot);
        for (src, dst) in frame.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
            dst.copy_from_slice(&[src[2], src[1], src[0], src[3]]);
        }

        self.surface.attach(Some(&self.shm.buffers[slot]), 0, 0);
        // Buffer space damage needs wl_surface version 4
        if self.surface.version() >= 4 {
            self.surface
                .damage_buffer(0, 0, self.width as i32, self.height as i32);
        } else {
            self.surface.damage(0, 0, self.width as i32, self.height as i32);
        }
        self.surface.commit();
        self.flush()?;

        Ok(Presentation::Submitted(slot))
    }

    fn close_requested(&self) -> bool {
        self.state.window.close_requested()
    }
}

impl Drop for WaylandSurface {
    fn drop(&mut self) {
        for buffer in self.shm.buffers.drain(..) {
            buffer.destroy();
        }
        self.shm.pool.destroy();
        if let Some(toplevel) = self.state.toplevel.take() {
            toplevel.destroy();
        }
        self.xdg_surface.destroy();
        self.surface.destroy();

        if let Err(e) = self.connection.flush() {
            debug!("Flush on close failed: {}", e);
        }
        debug!("Closed Wayland window");
    }
}

impl ShmBuffers {
    fn new(
        shm: &wl_shm::WlShm,
        width: u32,
        height: u32,
        qh: &QueueHandle<WaylandState>,
    ) -> Result<Self> {
        let stride = width as usize * 4;
        let frame_len = stride * height as usize;
        let len = frame_len * SLOT_COUNT;

        let raw = unsafe {
            libc::memfd_create(
                b"camrot-shm\0".as_ptr() as *const libc::c_char,
                libc::MFD_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(presentation_err("memfd_create failed", io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
            return Err(presentation_err("ftruncate failed", io::Error::last_os_error()));
        }

        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(presentation_err("mmap failed", io::Error::last_os_error()));
        }

        let pool = shm.create_pool(fd.as_fd(), len as i32, qh, ());
        let buffers = (0..SLOT_COUNT)
            .map(|slot| {
                pool.create_buffer(
                    (slot * frame_len) as i32,
                    width as i32,
                    height as i32,
                    stride as i32,
                    wl_shm::Format::Argb8888,
                    qh,
                    slot,
                )
            })
            .collect();

        Ok(Self {
            _fd: fd,
            map,
            len,
            frame_len,
            pool,
            buffers,
        })
    }

    fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        let all = unsafe { std::slice::from_raw_parts_mut(self.map as *mut u8, self.len) };
        &mut all[slot * self.frame_len..(slot + 1) * self.frame_len]
    }
}

impl Drop for ShmBuffers {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map, self.len);
        }
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for WaylandState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            match interface.as_str() {
                "wl_compositor" => {
                    state.compositor = Some(registry.bind(name, version.min(4), qh, ()));
                }
                "wl_shm" => {
                    state.shm = Some(registry.bind(name, 1, qh, ()));
                }
                "xdg_wm_base" => {
                    state.wm_base = Some(registry.bind(name, 1, qh, ()));
                }
                "wl_seat" => {
                    state.seat = Some(registry.bind(name, 1, qh, ()));
                }
                _ => {}
            }
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for WaylandState {
    fn event(
        _: &mut Self,
        wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for WaylandState {
    fn event(
        state: &mut Self,
        xdg_surface: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            xdg_surface.ack_configure(serial);
            state.window.surface_configure(serial);
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                state.window.toplevel_configure(width, height)
            }
            xdg_toplevel::Event::Close => state.window.toplevel_close(),
            _ => {}
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for WaylandState {
    fn event(
        state: &mut Self,
        seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_seat::Event::Capabilities {
            capabilities: WEnum::Value(caps),
        } = event
        {
            let has_pointer = caps.contains(wl_seat::Capability::Pointer);

            if has_pointer && state.pointer.is_none() {
                state.pointer = Some(seat.get_pointer(qh, ()));
            } else if !has_pointer {
                state.pointer = None;
            }
        }
    }
}

impl Dispatch<wl_pointer::WlPointer, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _: &wl_pointer::WlPointer,
        event: wl_pointer::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            wl_pointer::Event::Enter {
                serial,
                surface_x,
                surface_y,
                ..
            } => state.window.pointer_enter(serial, surface_x, surface_y),
            wl_pointer::Event::Leave { serial, .. } => state.window.pointer_leave(serial),
            wl_pointer::Event::Motion {
                surface_x,
                surface_y,
                ..
            } => state.window.pointer_motion(surface_x, surface_y),
            wl_pointer::Event::Button {
                serial,
                button,
                state: button_state,
                ..
            } => {
                let pressed =
                    matches!(button_state, WEnum::Value(wl_pointer::ButtonState::Pressed));

                if let Some(WindowRequest::Move { serial }) =
                    state.window.pointer_button(serial, button, pressed)
                {
                    if let (Some(toplevel), Some(seat)) = (&state.toplevel, &state.seat) {
                        toplevel._move(seat, serial);
                    }
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, usize> for WaylandState {
    fn event(
        state: &mut Self,
        _: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        slot: &usize,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            state.window.buffer_release(*slot);
        }
    }
}

delegate_noop!(WaylandState: ignore wl_compositor::WlCompositor);
delegate_noop!(WaylandState: ignore wl_surface::WlSurface);
delegate_noop!(WaylandState: ignore wl_shm::WlShm);
delegate_noop!(WaylandState: ignore wl_shm_pool::WlShmPool);

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn presentation_err<E: std::fmt::Display>(context: &str, e: E) -> Error {
    Error::PresentationError(format!("{}: {}", context, e))
}

fn missing_global(interface: &str) -> Error {
    Error::PresentationError(format!("compositor does not offer {}", interface))
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    #[ignore = "needs a Wayland compositor"]
    fn test_open_window() {
        let mut surface = WaylandSurface::connect(64, 48, "camrot test").unwrap();
        surface.dispatch().unwrap();

        let frame = RgbaImage::new(64, 48);
        assert_ne!(
            surface.present(&frame).unwrap(),
            Presentation::Dropped,
            "first frame should find a free buffer"
        );
    }
}
