//! Frame and access-unit types flowing between pipeline stages.

use bytemuck::{Pod, Zeroable};

/// One encoded chunk of the input stream in presentation order. Not
/// necessarily one display frame; the decoder consumes these verbatim.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// Annex-B bytes including the start-code prefix. Empty for the
    /// end-of-stream marker.
    pub data: Vec<u8>,
    /// Sentinel: no further input follows on this queue.
    pub eos: bool,
}

impl AccessUnit {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, eos: false }
    }

    /// The end-of-stream marker pushed after the last real unit.
    pub fn end_of_stream() -> Self {
        Self {
            data: Vec::new(),
            eos: true,
        }
    }
}

/// A decoded frame handed from the decoder to the bridge.
///
/// Owned exclusively by the orchestrator between dequeue and bridge hand-off;
/// dropping it returns the buffer. Holding more than one at a time defeats
/// the pipeline's bounded-memory guarantee.
#[derive(Debug)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in microseconds, reconstructed from the frame
    /// index and the stream frame rate.
    pub pts_us: i64,
    /// Sentinel frame carrying no pixels: the decoder has drained.
    pub eos: bool,
    /// Tightly packed RGBA8 pixels.
    pub data: Vec<u8>,
}

impl DecodedFrame {
    pub fn end_of_stream() -> Self {
        Self {
            width: 0,
            height: 0,
            pts_us: 0,
            eos: true,
            data: Vec::new(),
        }
    }
}

/// One encoded unit produced by the encoder, classified for the muxer.
#[derive(Debug, Clone)]
pub struct EncodedAccessUnit {
    /// Annex-B bytes including the start-code prefix.
    pub data: Vec<u8>,
    /// Codec configuration (SPS/PPS). The first of these is the
    /// format-changed event that opens the output track.
    pub is_config: bool,
    /// A sync sample (IDR slice).
    pub is_keyframe: bool,
    /// Carries picture data and therefore consumes one output timestamp.
    /// SEI and delimiter units are written but do not advance the clock.
    pub is_frame: bool,
    /// Sentinel: the encoder has drained.
    pub eos: bool,
}

impl EncodedAccessUnit {
    pub fn end_of_stream() -> Self {
        Self {
            data: Vec::new(),
            is_config: false,
            is_keyframe: false,
            is_frame: false,
            eos: true,
        }
    }
}

/// Vertex for rendering a full-screen quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Vertices for a full-screen quad.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    /// Indices for the quad (two triangles).
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}
