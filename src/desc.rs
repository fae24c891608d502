// Resource descriptors
//
// Immutable value types describing buffers and textures, plus the creation
// rules every backend relies on. A descriptor that fails `validate` never
// reaches a backend.

use bitflags::bitflags;

use crate::error::{EngineError, Result};

/// How a resource is expected to be used by the CPU and the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Usage {
    /// GPU read/write, updated through copies
    #[default]
    Default,
    /// Initialized once at creation, never written again
    Immutable,
    /// Rewritten by the CPU every frame through `Map(Write, Discard)`
    Dynamic,
    /// CPU-visible staging storage (texture spelling of `CpuAccessible`)
    Staging,
    /// CPU-visible storage mapped either for reading or for writing
    CpuAccessible,
}

impl Usage {
    /// Staging and CpuAccessible share the same rules.
    pub fn is_cpu_accessible(self) -> bool {
        matches!(self, Usage::Staging | Usage::CpuAccessible)
    }
}

bitflags! {
    /// Pipeline bindings a resource may be used with
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER    = 1 << 0;
        const INDEX_BUFFER     = 1 << 1;
        const UNIFORM_BUFFER   = 1 << 2;
        const SHADER_RESOURCE  = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const INDIRECT_ARGS    = 1 << 5;
        const RENDER_TARGET    = 1 << 6;
        const DEPTH_STENCIL    = 1 << 7;
    }
}

bitflags! {
    /// CPU access declared at creation. Empty means no CPU access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CpuAccess: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferMode {
    #[default]
    Undefined,
    Structured,
    Formatted,
    Raw,
}

/// Texel formats known to the core. Only the size matters here; the Vulkan
/// backend carries its own translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    R16Float,
    Rgba16Float,
    R32Float,
    R32Uint,
    Rg32Float,
    Rgba32Float,
    D32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm | TextureFormat::R16Float => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::D32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::D32Float)
    }
}

/// Buffer description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: Usage,
    pub bind_flags: BindFlags,
    pub cpu_access: CpuAccess,
    pub mode: BufferMode,
    /// Element stride for structured buffers
    pub element_stride: u32,
    /// Element format for formatted buffers
    pub format: Option<TextureFormat>,
}

impl BufferDesc {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            usage: Usage::Default,
            bind_flags: BindFlags::empty(),
            cpu_access: CpuAccess::empty(),
            mode: BufferMode::Undefined,
            element_stride: 0,
            format: None,
        }
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn bind_flags(mut self, bind_flags: BindFlags) -> Self {
        self.bind_flags = bind_flags;
        self
    }

    pub fn cpu_access(mut self, cpu_access: CpuAccess) -> Self {
        self.cpu_access = cpu_access;
        self
    }

    pub fn structured(mut self, element_stride: u32) -> Self {
        self.mode = BufferMode::Structured;
        self.element_stride = element_stride;
        self
    }

    pub fn formatted(mut self, format: TextureFormat) -> Self {
        self.mode = BufferMode::Formatted;
        self.format = Some(format);
        self
    }

    /// Check creation rules against the optional initial data.
    pub fn validate(&self, initial_data: Option<&[u8]>) -> Result<()> {
        if self.size == 0 {
            return Err(config_error(&self.name, "buffer size must not be zero"));
        }
        validate_usage(&self.name, self.usage, self.cpu_access, initial_data, self.size)?;

        if self
            .bind_flags
            .intersects(BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS)
        {
            match self.mode {
                BufferMode::Structured => {
                    if self.element_stride == 0 {
                        return Err(config_error(
                            &self.name,
                            "element stride cannot be zero for a structured buffer",
                        ));
                    }
                    if self.size % u64::from(self.element_stride) != 0 {
                        return Err(config_error(
                            &self.name,
                            "buffer size must be a multiple of the element stride",
                        ));
                    }
                }
                BufferMode::Formatted => {
                    if self.format.is_none() {
                        return Err(config_error(
                            &self.name,
                            "formatted buffer must specify an element format",
                        ));
                    }
                }
                BufferMode::Raw | BufferMode::Undefined => {}
            }
        }

        if self
            .bind_flags
            .intersects(BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL)
        {
            return Err(config_error(
                &self.name,
                "buffers cannot be bound as render targets or depth-stencil",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    Tex1D,
    Tex1DArray,
    Tex2D,
    Tex2DArray,
    Tex3D,
}

/// Texture description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub name: String,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, array size otherwise
    pub depth_or_array_size: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub usage: Usage,
    pub bind_flags: BindFlags,
    pub cpu_access: CpuAccess,
}

/// Placement of one subresource in a tightly packed linear layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceFootprint {
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_pitch: u64,
    pub depth_pitch: u64,
    pub size: u64,
}

impl TextureDesc {
    pub fn new_2d(name: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            name: name.into(),
            dimension: TextureDimension::Tex2D,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels: 1,
            format,
            usage: Usage::Default,
            bind_flags: BindFlags::empty(),
            cpu_access: CpuAccess::empty(),
        }
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn bind_flags(mut self, bind_flags: BindFlags) -> Self {
        self.bind_flags = bind_flags;
        self
    }

    pub fn cpu_access(mut self, cpu_access: CpuAccess) -> Self {
        self.cpu_access = cpu_access;
        self
    }

    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn array_size(&self) -> u32 {
        match self.dimension {
            TextureDimension::Tex3D => 1,
            _ => self.depth_or_array_size,
        }
    }

    pub fn depth(&self) -> u32 {
        match self.dimension {
            TextureDimension::Tex3D => self.depth_or_array_size,
            _ => 1,
        }
    }

    pub fn max_mip_levels(&self) -> u32 {
        let largest = self.width.max(self.height).max(self.depth()).max(1);
        32 - largest.leading_zeros()
    }

    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        (
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth() >> mip).max(1),
        )
    }

    fn mip_size(&self, mip: u32) -> u64 {
        let (w, h, d) = self.mip_extent(mip);
        u64::from(w) * u64::from(h) * u64::from(d) * u64::from(self.format.bytes_per_texel())
    }

    fn slice_size(&self) -> u64 {
        (0..self.mip_levels).map(|mip| self.mip_size(mip)).sum()
    }

    /// Total size of all subresources in the linear layout.
    pub fn linear_size(&self) -> u64 {
        self.slice_size() * u64::from(self.array_size())
    }

    /// Linear footprint of `(mip, slice)`. Slices are laid out one after
    /// another, each holding its full mip chain.
    pub fn footprint(&self, mip: u32, slice: u32) -> Option<SubresourceFootprint> {
        if mip >= self.mip_levels || slice >= self.array_size() {
            return None;
        }
        let offset = u64::from(slice) * self.slice_size()
            + (0..mip).map(|m| self.mip_size(m)).sum::<u64>();
        let (width, height, depth) = self.mip_extent(mip);
        let row_pitch = u64::from(width) * u64::from(self.format.bytes_per_texel());
        let depth_pitch = row_pitch * u64::from(height);
        Some(SubresourceFootprint {
            offset,
            width,
            height,
            depth,
            row_pitch,
            depth_pitch,
            size: depth_pitch * u64::from(depth),
        })
    }

    /// Check creation rules. Initial data uses the linear layout of
    /// [`TextureDesc::footprint`].
    pub fn validate(&self, initial_data: Option<&[u8]>) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth_or_array_size == 0 {
            return Err(config_error(&self.name, "texture extents must not be zero"));
        }
        if matches!(self.dimension, TextureDimension::Tex1D | TextureDimension::Tex1DArray)
            && self.height != 1
        {
            return Err(config_error(&self.name, "1D textures must have a height of 1"));
        }
        if matches!(self.dimension, TextureDimension::Tex1D | TextureDimension::Tex2D)
            && self.depth_or_array_size != 1
        {
            return Err(config_error(
                &self.name,
                "non-array textures must have an array size of 1",
            ));
        }
        if self.mip_levels == 0 || self.mip_levels > self.max_mip_levels() {
            return Err(config_error(
                &self.name,
                &format!(
                    "mip level count {} is out of range 1..={}",
                    self.mip_levels,
                    self.max_mip_levels()
                ),
            ));
        }
        if self.bind_flags.contains(BindFlags::DEPTH_STENCIL) && !self.format.is_depth() {
            return Err(config_error(
                &self.name,
                "depth-stencil binding requires a depth format",
            ));
        }
        if self.bind_flags.intersects(
            BindFlags::VERTEX_BUFFER
                | BindFlags::INDEX_BUFFER
                | BindFlags::UNIFORM_BUFFER
                | BindFlags::INDIRECT_ARGS,
        ) {
            return Err(config_error(
                &self.name,
                "textures cannot be bound as vertex, index, uniform or indirect buffers",
            ));
        }
        validate_usage(
            &self.name,
            self.usage,
            self.cpu_access,
            initial_data,
            self.linear_size(),
        )
    }
}

/// Description of either resource kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceDesc {
    Buffer(BufferDesc),
    Texture(TextureDesc),
}

impl ResourceDesc {
    pub fn name(&self) -> &str {
        match self {
            ResourceDesc::Buffer(desc) => &desc.name,
            ResourceDesc::Texture(desc) => &desc.name,
        }
    }

    pub fn usage(&self) -> Usage {
        match self {
            ResourceDesc::Buffer(desc) => desc.usage,
            ResourceDesc::Texture(desc) => desc.usage,
        }
    }

    pub fn bind_flags(&self) -> BindFlags {
        match self {
            ResourceDesc::Buffer(desc) => desc.bind_flags,
            ResourceDesc::Texture(desc) => desc.bind_flags,
        }
    }

    pub fn cpu_access(&self) -> CpuAccess {
        match self {
            ResourceDesc::Buffer(desc) => desc.cpu_access,
            ResourceDesc::Texture(desc) => desc.cpu_access,
        }
    }

    /// Bytes of storage: buffer size or the linear size of all subresources
    pub fn byte_size(&self) -> u64 {
        match self {
            ResourceDesc::Buffer(desc) => desc.size,
            ResourceDesc::Texture(desc) => desc.linear_size(),
        }
    }
}

fn config_error(name: &str, message: &str) -> EngineError {
    EngineError::Configuration(format!("Resource \"{}\": {}", name, message))
}

fn validate_usage(
    name: &str,
    usage: Usage,
    cpu_access: CpuAccess,
    initial_data: Option<&[u8]>,
    size: u64,
) -> Result<()> {
    if let Some(data) = initial_data {
        if data.len() as u64 > size {
            return Err(config_error(
                name,
                &format!("initial data ({} bytes) exceeds resource size ({} bytes)", data.len(), size),
            ));
        }
    }

    match usage {
        Usage::Immutable => {
            let Some(data) = initial_data else {
                return Err(config_error(
                    name,
                    "immutable resources must be initialized with data at creation time",
                ));
            };
            if data.len() as u64 != size {
                return Err(config_error(
                    name,
                    &format!(
                        "immutable resource initial data must cover the whole resource ({} of {} bytes)",
                        data.len(),
                        size
                    ),
                ));
            }
            if !cpu_access.is_empty() {
                return Err(config_error(name, "immutable resources cannot declare CPU access"));
            }
        }
        Usage::Default => {
            if !cpu_access.is_empty() {
                return Err(config_error(name, "default-usage resources cannot declare CPU access"));
            }
        }
        Usage::Dynamic => {
            if initial_data.is_some() {
                return Err(config_error(name, "dynamic resources must be initialized via map"));
            }
            if cpu_access != CpuAccess::WRITE {
                return Err(config_error(
                    name,
                    "dynamic resources must declare CPU write access (and only write access)",
                ));
            }
        }
        Usage::Staging | Usage::CpuAccessible => {
            if cpu_access != CpuAccess::READ && cpu_access != CpuAccess::WRITE {
                return Err(config_error(
                    name,
                    "exactly one of CPU read or CPU write access must be specified for a cpu-accessible resource",
                ));
            }
            if cpu_access == CpuAccess::WRITE && initial_data.is_some() {
                return Err(config_error(
                    name,
                    "cpu-writable staging resources must be updated via map",
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_buffer_requires_data() {
        let desc = BufferDesc::new("vb", 64)
            .usage(Usage::Immutable)
            .bind_flags(BindFlags::VERTEX_BUFFER);
        let err = desc.validate(None).unwrap_err();
        assert!(err.is_configuration());

        let data = [0u8; 64];
        assert!(desc.validate(Some(&data)).is_ok());
        assert!(desc.validate(Some(&data[..32])).is_err());
    }

    #[test]
    fn dynamic_buffer_rejects_initial_data() {
        let desc = BufferDesc::new("cb", 256)
            .usage(Usage::Dynamic)
            .bind_flags(BindFlags::UNIFORM_BUFFER)
            .cpu_access(CpuAccess::WRITE);
        assert!(desc.validate(None).is_ok());
        assert!(desc.validate(Some(&[1, 2, 3])).unwrap_err().is_configuration());
        assert!(desc.clone().cpu_access(CpuAccess::empty()).validate(None).is_err());
    }

    #[test]
    fn cpu_accessible_requires_exactly_one_access() {
        let base = BufferDesc::new("staging", 16).usage(Usage::CpuAccessible);
        assert!(base.clone().validate(None).is_err());
        assert!(base
            .clone()
            .cpu_access(CpuAccess::READ | CpuAccess::WRITE)
            .validate(None)
            .is_err());
        assert!(base.clone().cpu_access(CpuAccess::READ).validate(None).is_ok());
        assert!(base.clone().cpu_access(CpuAccess::WRITE).validate(None).is_ok());
        assert!(base
            .cpu_access(CpuAccess::WRITE)
            .validate(Some(&[0u8; 16]))
            .is_err());
    }

    #[test]
    fn structured_buffer_needs_stride() {
        let desc = BufferDesc::new("sb", 96)
            .bind_flags(BindFlags::SHADER_RESOURCE)
            .structured(0);
        assert!(desc.validate(None).is_err());
        assert!(desc.clone().structured(32).validate(None).is_ok());
        assert!(desc.structured(40).validate(None).is_err());
    }

    #[test]
    fn texture_footprints_are_packed_slice_major() {
        let desc = TextureDesc {
            dimension: TextureDimension::Tex2DArray,
            depth_or_array_size: 2,
            ..TextureDesc::new_2d("arr", 4, 4, TextureFormat::Rgba8Unorm)
        }
        .mip_levels(3);

        let mip0 = desc.footprint(0, 0).unwrap();
        assert_eq!(mip0.offset, 0);
        assert_eq!(mip0.row_pitch, 16);
        assert_eq!(mip0.size, 64);

        let mip2 = desc.footprint(2, 0).unwrap();
        assert_eq!((mip2.width, mip2.height), (1, 1));
        assert_eq!(mip2.offset, 64 + 16);

        let slice1 = desc.footprint(0, 1).unwrap();
        assert_eq!(slice1.offset, 84);
        assert_eq!(desc.linear_size(), 168);
        assert!(desc.footprint(3, 0).is_none());
        assert!(desc.footprint(0, 2).is_none());
    }

    #[test]
    fn texture_mip_count_is_bounded() {
        let desc = TextureDesc::new_2d("t", 8, 2, TextureFormat::R8Unorm);
        assert_eq!(desc.max_mip_levels(), 4);
        assert!(desc.clone().mip_levels(4).validate(None).is_ok());
        assert!(desc.mip_levels(5).validate(None).is_err());
    }
}
