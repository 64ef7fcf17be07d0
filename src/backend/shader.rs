//! # Continuous Shader Backend
//!
//! Rotates on the GPU. The frame is colour converted by a [`Blitter`], uploaded as a texture
//! and drawn as a quad whose vertices are rotated about the frame's centre, then the render
//! target is read back into the output image. The render target is cleared to transparent, so
//! the margins the rotated quad leaves uncovered are filled with the background colour by the
//! same [`Blitter::fill`] the other backends use.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use image::{Rgba, RgbaImage};
use log::{debug, info};

use super::{Blitter, RotationBackend};
use crate::convert::YuyvFrame;
use crate::error::{Error, Result};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

const SHADER_SOURCE: &str = include_str!("shader.wgsl");

const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const CLEAR: wgpu::Color = wgpu::Color::TRANSPARENT;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    rotation: f32,
    _pad: [f32; 3],
    image_size: [f32; 2],
    window_size: [f32; 2],
}

/// Size-dependent GPU resources.
struct Targets {
    width: u32,
    height: u32,
    padded_row: u32,
    source: wgpu::Texture,
    target: wgpu::Texture,
    target_view: wgpu::TextureView,
    readback: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

pub struct ContinuousShader<B: Blitter> {
    blitter: B,
    background: Rgba<u8>,
    rgba: RgbaImage,
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    uniforms: wgpu::Buffer,
    targets: Option<Targets>,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl<B: Blitter> ContinuousShader<B> {
    /// Acquire a GPU and build the rotation pipeline.
    pub fn new(blitter: B, background: Rgba<u8>) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| Error::ShaderError(format!("no GPU adapter: {}", e)))?;

        info!("Shader backend using {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("camrot"),
            ..Default::default()
        }))
        .map_err(|e| Error::ShaderError(format!("cannot create device: {}", e)))?;

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Rotation Shader"),
            source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Rotation Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Rotation Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Rotation Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TEXTURE_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Frame Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Rotation Uniforms"),
            size: std::mem::size_of::<Params>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            blitter,
            background,
            rgba: RgbaImage::new(0, 0),
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            uniforms,
            targets: None,
        })
    }

    fn ensure_targets(&mut self, width: u32, height: u32) {
        let stale = match &self.targets {
            Some(t) => t.width != width || t.height != height,
            None => true,
        };

        if stale {
            debug!("Creating {}x{} shader targets", width, height);
            self.targets = Some(self.create_targets(width, height));
        }
    }

    fn create_targets(&self, width: u32, height: u32) -> Targets {
        let size = extent(width, height);

        let source = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Frame Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let target = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Rotated Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        // Copies to buffers need rows aligned to 256 bytes
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row = (4 * width + align - 1) / align * align;

        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let source_view = source.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Rotation Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        Targets {
            width,
            height,
            padded_row,
            target_view: target.create_view(&wgpu::TextureViewDescriptor::default()),
            source,
            target,
            readback,
            bind_group,
        }
    }
}

impl<B: Blitter> RotationBackend for ContinuousShader<B> {
    fn name(&self) -> &'static str {
        "shader"
    }

    fn transform(&mut self, frame: &YuyvFrame, degrees: i32, out: &mut RgbaImage) -> Result<()> {
        let (width, height) = frame.dimensions();

        self.blitter.convert(frame, &mut self.rgba)?;

        let params = Params {
            rotation: (degrees as f32).to_radians(),
            _pad: [0.0; 3],
            image_size: [width as f32, height as f32],
            window_size: [width as f32, height as f32],
        };
        self.queue
            .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&params));

        self.ensure_targets(width, height);
        let (device, queue, pipeline) = (&self.device, &self.queue, &self.pipeline);
        let targets = match &self.targets {
            Some(t) => t,
            None => return Err(Error::ShaderError(String::from("render targets missing"))),
        };

        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &targets.source,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            self.rgba.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            extent(width, height),
        );

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Rotation Encoder"),
        });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Rotation Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &targets.target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(CLEAR),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &targets.bind_group, &[]);
            pass.draw(0..4, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &targets.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &targets.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(targets.padded_row),
                    rows_per_image: Some(height),
                },
            },
            extent(width, height),
        );

        queue.submit(Some(encoder.finish()));

        let slice = targets.readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::ShaderError(format!("{}", e)))?;
        rx.recv()
            .map_err(|_| Error::ShaderError(String::from("readback callback dropped")))?
            .map_err(|e| Error::ShaderError(format!("readback failed: {}", e)))?;

        if out.dimensions() != (width, height) {
            *out = RgbaImage::new(width, height);
        }

        let composited = {
            let mapped = slice.get_mapped_range();
            composite(
                &mut self.blitter,
                self.background,
                &mapped,
                targets.padded_row as usize,
                out,
            )
        };
        targets.readback.unmap();

        composited
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Fill `out` with the background, then lay the covered pixels of the rendered rows over it.
fn composite<B: Blitter>(
    blitter: &mut B,
    background: Rgba<u8>,
    rendered: &[u8],
    padded_row: usize,
    out: &mut RgbaImage,
) -> Result<()> {
    blitter.fill(out, background)?;

    let row = 4 * out.width() as usize;
    for (y, dst) in out.chunks_exact_mut(row).enumerate() {
        let start = y * padded_row;
        let src = &rendered[start..start + row];

        for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
            // Only the cleared margins are transparent
            if s[3] != 0 {
                d.copy_from_slice(s);
            }
        }
    }

    Ok(())
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::backend::SoftwareBlitter;
    use crate::convert::{approx_eq, encode_yuyv};
    use image::Rgb;

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<Params>(), 32);
    }

    struct CountingBlitter {
        fills: usize,
    }

    impl Blitter for CountingBlitter {
        fn convert(&mut self, frame: &YuyvFrame, out: &mut RgbaImage) -> Result<()> {
            SoftwareBlitter.convert(frame, out)
        }

        fn blit(
            &mut self,
            src: &RgbaImage,
            dst: &mut RgbaImage,
            window: crate::backend::Rect,
            bucket: crate::backend::Bucket,
        ) -> Result<()> {
            SoftwareBlitter.blit(src, dst, window, bucket)
        }

        fn fill(&mut self, dst: &mut RgbaImage, colour: Rgba<u8>) -> Result<()> {
            self.fills += 1;
            SoftwareBlitter.fill(dst, colour)
        }
    }

    #[test]
    fn test_margins_filled_by_blitter() {
        // Two rows of four pixels padded to 64 bytes, the outer columns left uncovered
        let mut rendered = vec![0u8; 128];
        for y in 0..2 {
            for x in 1..3 {
                let i = y * 64 + x * 4;
                rendered[i..i + 4].copy_from_slice(&[10, 20, 30, 255]);
            }
        }

        let mut blitter = CountingBlitter { fills: 0 };
        let background = Rgba([255, 255, 255, 255]);
        let mut out = RgbaImage::new(4, 2);

        composite(&mut blitter, background, &rendered, 64, &mut out).unwrap();

        assert_eq!(blitter.fills, 1);
        for y in 0..2 {
            assert_eq!(*out.get_pixel(0, y), background);
            assert_eq!(*out.get_pixel(1, y), Rgba([10, 20, 30, 255]));
            assert_eq!(*out.get_pixel(2, y), Rgba([10, 20, 30, 255]));
            assert_eq!(*out.get_pixel(3, y), background);
        }
    }

    #[test]
    #[ignore = "needs a GPU"]
    fn test_quarter_turn_on_gpu() {
        let data = encode_yuyv(32, 32, |x, _| {
            if x < 16 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let frame = YuyvFrame::new(32, 32, &data).unwrap();
        let mut backend = ContinuousShader::new(SoftwareBlitter, Rgba([0, 0, 0, 255])).unwrap();
        let mut out = RgbaImage::new(0, 0);

        backend.transform(&frame, 90, &mut out).unwrap();

        assert!(approx_eq(*out.get_pixel(16, 2), Rgba([255, 0, 0, 255]), 8));
        assert!(approx_eq(*out.get_pixel(16, 29), Rgba([0, 0, 255, 255]), 8));
    }
}
