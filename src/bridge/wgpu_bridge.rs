//! wgpu implementation of the frame bridge.
//!
//! Renders the configured per-pixel transform over a full-screen quad. The
//! built-in effect (mosaic cells plus palette quantization) always runs
//! first; optional user fragment shaders are chained after it. Transform
//! uniforms are uploaded once per run; only the input image binding changes
//! per frame.

use super::{BridgeStrategy, FrameBridge};
use crate::error::{KaleidoError, Result};
use crate::frame::{DecodedFrame, QuadVertex};
use crate::source::StreamDescriptor;
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::ShaderStage;
use std::borrow::Cow;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

/// Upper bound on palette entries the shader will scan.
pub const MAX_PALETTE: usize = 8;

/// Default vertex shader in WGSL.
const VERTEX_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}
"#;

/// Built-in effect: snap sampling to a mosaic grid, quantize to the nearest
/// palette entry, and mix with the source by effect strength.
const EFFECT_SHADER: &str = r#"
struct Uniforms {
    strength: f32,
    cell_size: f32,
    width: f32,
    height: f32,
    palette_len: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
    palette: array<vec4<f32>, 8>,
}

@group(0) @binding(0) var t_texture: texture_2d<f32>;
@group(0) @binding(1) var s_sampler: sampler;
@group(0) @binding(2) var<uniform> u: Uniforms;

@fragment
fn fs_main(@location(0) tex_coords: vec2<f32>) -> @location(0) vec4<f32> {
    var uv = tex_coords;
    if (u.cell_size > 1.0) {
        let cells = vec2<f32>(u.width, u.height) / u.cell_size;
        uv = (floor(uv * cells) + vec2<f32>(0.5, 0.5)) / cells;
    }
    let src = textureSample(t_texture, s_sampler, uv);
    var shaded = src.rgb;
    if (u.palette_len > 0u) {
        var best = 1e9;
        for (var i = 0u; i < u.palette_len; i = i + 1u) {
            let c = u.palette[i].rgb;
            let d = src.rgb - c;
            let d2 = dot(d, d);
            if (d2 < best) {
                best = d2;
                shaded = c;
            }
        }
    }
    let original = textureSample(t_texture, s_sampler, tex_coords);
    let mixed = mix(original.rgb, shaded, clamp(u.strength, 0.0, 1.0));
    return vec4<f32>(mixed, 1.0);
}
"#;

/// Uniform bundle consumed by the effect shader. Immutable during a run.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TransformUniforms {
    pub strength: f32,
    pub cell_size: f32,
    pub width: f32,
    pub height: f32,
    pub palette_len: u32,
    pub _pad: [u32; 3],
    pub palette: [[f32; 4]; MAX_PALETTE],
}

/// Shader source with language specification.
#[derive(Debug, Clone)]
pub enum ShaderSource {
    /// GLSL fragment shader source code
    Glsl(String),
    /// WGSL shader source code
    Wgsl(String),
}

/// GPU bridge using wgpu, bridged-copy strategy.
pub struct WgpuBridge {
    device: wgpu::Device,
    queue: wgpu::Queue,
    render_pipelines: Vec<wgpu::RenderPipeline>,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    bind_groups: Vec<wgpu::BindGroup>,
    input_texture: wgpu::Texture,
    output_textures: Vec<wgpu::Texture>,
    readback_buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_bytes_per_row: u32,
}

impl WgpuBridge {
    /// Build the bridge for one run. `strategy` comes from the capability
    /// check against the encoder's input surface; requesting the direct
    /// strategy here fails because the encoder surface is not reachable
    /// from the wgpu rendering context on this target.
    pub fn new(
        desc: &StreamDescriptor,
        uniforms: TransformUniforms,
        extra_shaders: Vec<ShaderSource>,
        strategy: BridgeStrategy,
    ) -> Result<Self> {
        if strategy == BridgeStrategy::DirectSurface {
            return Err(KaleidoError::Setup(
                "direct-surface bridging is not reachable from this encoder's input surface"
                    .into(),
            ));
        }

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| KaleidoError::Setup(format!("failed to find GPU adapter: {e:?}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Kaleido Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| KaleidoError::Setup(format!("failed to open GPU device: {e}")))?;

        // Built-in effect first, then any user shaders.
        let mut shader_sources = vec![(EFFECT_SHADER.to_string(), "fs_main")];
        for shader in extra_shaders {
            match shader {
                ShaderSource::Glsl(glsl) => shader_sources.push((glsl_to_wgsl(&glsl)?, "main")),
                ShaderSource::Wgsl(wgsl) => shader_sources.push((wgsl, "fs_main")),
            }
        }

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(VERTEX_SHADER)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Texture Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Render Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let mut render_pipelines = Vec::new();
        for (i, (fragment_wgsl, entry_point)) in shader_sources.into_iter().enumerate() {
            let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&format!("Fragment Shader {}", i)),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(fragment_wgsl)),
            });

            let render_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&format!("Render Pipeline {}", i)),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &vertex_module,
                    entry_point: Some("vs_main"),
                    buffers: &[QuadVertex::layout()],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &fragment_module,
                    entry_point: Some(entry_point),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: wgpu::TextureFormat::Rgba8Unorm,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            });
            render_pipelines.push(render_pipeline);
        }

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Texture Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        // Bound once for the whole run; only the input image binding
        // changes between frames.
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Uniform Buffer"),
            contents: bytemuck::cast_slice(&[uniforms]),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let (width, height) = (desc.width, desc.height);
        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        let input_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Input Texture"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let mut output_textures = Vec::new();
        for i in 0..render_pipelines.len() {
            output_textures.push(device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&format!("Intermediate Texture {}", i)),
                size: extent,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            }));
        }

        // Row pitch for texture-to-buffer copies must be 256-byte aligned.
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = (width * 4).div_ceil(align) * align;
        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (padded_bytes_per_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut bind_groups = Vec::new();
        for i in 0..render_pipelines.len() {
            let input_view = if i == 0 {
                input_texture.create_view(&wgpu::TextureViewDescriptor::default())
            } else {
                output_textures[i - 1].create_view(&wgpu::TextureViewDescriptor::default())
            };
            bind_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("Bind Group {}", i)),
                layout: &bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&input_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                ],
            }));
        }

        info!(
            "bridge initialized: {} pass(es), bridged copy at {}x{}",
            render_pipelines.len(),
            width,
            height
        );
        Ok(Self {
            device,
            queue,
            render_pipelines,
            vertex_buffer,
            index_buffer,
            bind_groups,
            input_texture,
            output_textures,
            readback_buffer,
            width,
            height,
            padded_bytes_per_row,
        })
    }
}

impl FrameBridge for WgpuBridge {
    fn strategy(&self) -> BridgeStrategy {
        BridgeStrategy::BridgedCopy
    }

    fn process(&mut self, frame: &DecodedFrame) -> Result<Vec<u8>> {
        if frame.width != self.width || frame.height != self.height {
            return Err(KaleidoError::stage(
                "bridge",
                format!(
                    "frame size {}x{} does not match pipeline {}x{}",
                    frame.width, frame.height, self.width, self.height
                ),
            ));
        }

        let start = std::time::Instant::now();
        let extent = wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        };

        // Per-frame input image binding.
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.input_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &frame.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.width * 4),
                rows_per_image: Some(self.height),
            },
            extent,
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Bridge Encoder"),
            });

        for (i, pipeline) in self.render_pipelines.iter().enumerate() {
            let output_view =
                self.output_textures[i].create_view(&wgpu::TextureViewDescriptor::default());
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(&format!("Render Pass {}", i)),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &self.bind_groups[i], &[]);
            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..6, 0, 0..1);
            drop(render_pass);
        }

        // The explicit domain crossing: final texture into a CPU-mappable
        // buffer bound for the encoder's input surface.
        let final_texture = self
            .output_textures
            .last()
            .ok_or_else(|| KaleidoError::stage("bridge", "no render passes configured"))?;
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: final_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.readback_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            extent,
        );

        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = self.readback_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| KaleidoError::stage("bridge", format!("device poll failed: {e:?}")))?;
        receiver
            .recv()
            .map_err(|_| KaleidoError::stage("bridge", "readback callback dropped"))?
            .map_err(|e| KaleidoError::stage("bridge", format!("readback map failed: {e:?}")))?;

        let data = buffer_slice.get_mapped_range();
        let row_bytes = (self.width * 4) as usize;
        let output = if self.padded_bytes_per_row as usize == row_bytes {
            data.to_vec()
        } else {
            let mut out = Vec::with_capacity(row_bytes * self.height as usize);
            for row in data.chunks_exact(self.padded_bytes_per_row as usize) {
                out.extend_from_slice(&row[..row_bytes]);
            }
            out
        };
        drop(data);
        self.readback_buffer.unmap();

        debug!("bridge pass took {:?}", start.elapsed());
        Ok(output)
    }
}

/// Converts a GLSL fragment shader to WGSL.
fn glsl_to_wgsl(glsl: &str) -> Result<String> {
    let mut frontend = Frontend::default();
    let options = Options::from(ShaderStage::Fragment);
    let module = frontend
        .parse(&options, glsl)
        .map_err(|e| KaleidoError::Shader(format!("GLSL parse error: {e:?}")))?;
    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator
        .validate(&module)
        .map_err(|e| KaleidoError::Shader(format!("shader validation error: {e:?}")))?;
    naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| KaleidoError::Shader(format!("WGSL generation error: {e:?}")))
}
