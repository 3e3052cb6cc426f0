use glam::{UVec2, Vec4};

use super::{BufferId, LoadOp, PipelineId, TextureId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Undefined,
    CopyDest,
    ShaderResource,
    RenderTarget,
    DepthWrite,
    UnorderedAccess,
    Present,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorAttachment {
    pub texture: TextureId,
    pub load: LoadOp,
    pub clear: Vec4,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthAttachment {
    pub texture: TextureId,
    pub load: LoadOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PushMarker(String),
    PopMarker,
    Barrier {
        texture: TextureId,
        state: ResourceState,
    },
    BeginRenderPass {
        label: String,
        colors: Vec<ColorAttachment>,
        depth: Option<DepthAttachment>,
    },
    EndRenderPass,
    SetViewport {
        origin: UVec2,
        extent: UVec2,
    },
    SetScissor {
        origin: UVec2,
        extent: UVec2,
    },
    BindPipeline(PipelineId),
    Draw {
        vertices: u32,
        instances: u32,
    },
    Dispatch {
        groups: [u32; 3],
    },
    CopyBufferToBuffer {
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: BufferId,
        src_offset: u64,
        bytes_per_row: u32,
        rows_per_image: u32,
        dst: TextureId,
        mip_level: u32,
        array_layer: u32,
        extent: UVec2,
    },
    GenerateMipmaps(TextureId),
    ExecuteSecondary(Vec<Command>),
}

/// Backend-neutral recording of GPU work. Devices translate the recorded
/// commands when the buffer is submitted.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    label: String,
    secondary: bool,
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            secondary: false,
            commands: Vec::new(),
        }
    }

    /// Secondary buffers are recorded off-thread and spliced into a primary
    /// buffer with `execute_secondary`.
    pub fn secondary(label: &str) -> Self {
        Self {
            label: label.to_string(),
            secondary: true,
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push_marker(&mut self, name: &str) {
        self.commands.push(Command::PushMarker(name.to_string()));
    }

    pub fn pop_marker(&mut self) {
        self.commands.push(Command::PopMarker);
    }

    pub fn barrier(&mut self, texture: TextureId, state: ResourceState) {
        self.commands.push(Command::Barrier { texture, state });
    }

    pub fn begin_render_pass(
        &mut self,
        label: &str,
        colors: Vec<ColorAttachment>,
        depth: Option<DepthAttachment>,
    ) {
        self.commands.push(Command::BeginRenderPass {
            label: label.to_string(),
            colors,
            depth,
        });
    }

    pub fn end_render_pass(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }

    pub fn set_viewport(&mut self, origin: UVec2, extent: UVec2) {
        self.commands.push(Command::SetViewport { origin, extent });
    }

    pub fn set_scissor(&mut self, origin: UVec2, extent: UVec2) {
        self.commands.push(Command::SetScissor { origin, extent });
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineId) {
        self.commands.push(Command::BindPipeline(pipeline));
    }

    pub fn draw(&mut self, vertices: u32, instances: u32) {
        self.commands.push(Command::Draw { vertices, instances });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Command::Dispatch { groups: [x, y, z] });
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) {
        self.commands.push(Command::CopyBufferToBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_buffer_to_texture(
        &mut self,
        src: BufferId,
        src_offset: u64,
        bytes_per_row: u32,
        rows_per_image: u32,
        dst: TextureId,
        mip_level: u32,
        array_layer: u32,
        extent: UVec2,
    ) {
        self.commands.push(Command::CopyBufferToTexture {
            src,
            src_offset,
            bytes_per_row,
            rows_per_image,
            dst,
            mip_level,
            array_layer,
            extent,
        });
    }

    pub fn generate_mipmaps(&mut self, texture: TextureId) {
        self.commands.push(Command::GenerateMipmaps(texture));
    }

    pub fn execute_secondary(&mut self, secondary: CommandBuffer) {
        if secondary.is_empty() {
            return;
        }
        self.commands.push(Command::ExecuteSecondary(secondary.commands));
    }

    /// Commands with secondary buffers expanded in place.
    pub fn flattened(&self) -> Vec<&Command> {
        fn walk<'a>(commands: &'a [Command], out: &mut Vec<&'a Command>) {
            for command in commands {
                match command {
                    Command::ExecuteSecondary(inner) => walk(inner, out),
                    c => out.push(c),
                }
            }
        }
        let mut out = Vec::with_capacity(self.commands.len());
        walk(&self.commands, &mut out);
        out
    }
}
