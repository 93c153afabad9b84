//! Resource descriptors and subresource arithmetic.

use crate::format::Format;
use std::borrow::Cow;

bitflags!(
    /// How a resource may be bound to the pipeline.
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct BindFlags: u32 {
        /// Bindable as a vertex buffer.
        const VERTEX_BUFFER = 0x1;
        /// Bindable as an index buffer.
        const INDEX_BUFFER = 0x2;
        /// Bindable as a constant (uniform) buffer.
        const CONSTANT_BUFFER = 0x4;
        /// Readable from shaders.
        const SHADER_RESOURCE = 0x8;
        /// Usable as the source of a transfer operation.
        const TRANSFER_SRC = 0x10;
        /// Usable as the destination of a transfer operation.
        const TRANSFER_DST = 0x20;
    }
);

bitflags!(
    /// Rules controlling where and how the resource's memory is allocated.
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct AllocationRules: u32 {
        /// Host visible, written sequentially by the CPU.
        const HOST_VISIBLE_SEQUENTIAL_WRITE = 0x1;
        /// Mapped once at creation and left mapped for its whole lifetime.
        const PERMANENTLY_MAPPED = 0x2;
        /// Do not share a memory page with other resources.
        const DEDICATED_PAGE = 0x4;
        /// The caller takes responsibility for cache coherency.
        const DISABLE_AUTO_CACHE_COHERENCY = 0x8;
    }
);

/// Identifies one mip level of one array layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubresourceId {
    /// Mip level, zero is the most detailed.
    pub mip: u8,
    /// Array layer.
    pub array_layer: u16,
}

/// Row and slice strides of texel data laid out in linear memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TexturePitches {
    /// Bytes between the starts of adjacent rows.
    pub row_pitch: u32,
    /// Bytes between the starts of adjacent depth slices.
    pub slice_pitch: u32,
}

/// Dimensionality of a texture resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Dimensionality {
    /// One dimensional.
    T1D,
    /// Two dimensional.
    T2D,
    /// Three dimensional.
    T3D,
}

/// Static description of a linear buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinearBufferDesc {
    /// Size of the buffer in bytes.
    pub size_in_bytes: u32,
}

impl LinearBufferDesc {
    /// Describe a buffer of `size_in_bytes` bytes.
    pub fn with_size(size_in_bytes: u32) -> Self {
        LinearBufferDesc { size_in_bytes }
    }
}

/// Static description of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TextureDesc {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Depth in texels; 1 for non-3D textures.
    pub depth: u32,
    /// Texel format.
    pub format: Format,
    /// Number of mip levels.
    pub mip_count: u8,
    /// Number of array layers; 1 for non-array textures.
    pub array_count: u16,
    /// Dimensionality of the texture.
    pub dimensionality: Dimensionality,
}

impl TextureDesc {
    /// Describe a simple 2D texture with the given mip chain length.
    pub fn plain_2d(width: u32, height: u32, format: Format, mip_count: u8) -> Self {
        TextureDesc {
            width,
            height,
            depth: 1,
            format,
            mip_count,
            array_count: 1,
            dimensionality: Dimensionality::T2D,
        }
    }

    /// Dimensions of the given mip level, never rounding below one texel.
    pub fn mip_dimensions(&self, mip: u8) -> (u32, u32, u32) {
        (
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth >> mip).max(1),
        )
    }

    /// Natural (tightly packed) pitches for the given mip level.
    pub fn natural_pitches(&self, mip: u8) -> TexturePitches {
        let (w, h, _) = self.mip_dimensions(mip);
        let row = w * self.format.texel_size();
        TexturePitches {
            row_pitch: row,
            slice_pitch: row * h,
        }
    }

    /// Number of subresources (mips × array layers).
    pub fn subresource_count(&self) -> u32 {
        u32::from(self.mip_count) * u32::from(self.array_count)
    }
}

/// Discriminates the resource families a descriptor can describe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResourceKind {
    /// An unstructured buffer of bytes.
    LinearBuffer(LinearBufferDesc),
    /// A texture with subresources.
    Texture(TextureDesc),
}

/// Full static description of a resource: what it is, how it binds, how its
/// memory is allocated, and a debugging name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Buffer or texture shape.
    pub kind: ResourceKind,
    /// Pipeline bind points the resource supports.
    pub bind_flags: BindFlags,
    /// Memory allocation rules.
    pub allocation_rules: AllocationRules,
    /// Name used for debugging and metrics output.
    pub name: Cow<'static, str>,
}

impl ResourceDesc {
    /// Describe a linear buffer.
    pub fn linear_buffer(
        bind_flags: BindFlags,
        allocation_rules: AllocationRules,
        size_in_bytes: u32,
        name: impl Into<Cow<'static, str>>,
    ) -> Self {
        ResourceDesc {
            kind: ResourceKind::LinearBuffer(LinearBufferDesc::with_size(size_in_bytes)),
            bind_flags,
            allocation_rules,
            name: name.into(),
        }
    }

    /// Describe a texture.
    pub fn texture(
        bind_flags: BindFlags,
        allocation_rules: AllocationRules,
        texture: TextureDesc,
        name: impl Into<Cow<'static, str>>,
    ) -> Self {
        ResourceDesc {
            kind: ResourceKind::Texture(texture),
            bind_flags,
            allocation_rules,
            name: name.into(),
        }
    }

    /// Total bytes of the resource's contents, summing every subresource for
    /// textures (tightly packed).
    pub fn byte_count(&self) -> u32 {
        match self.kind {
            ResourceKind::LinearBuffer(ref b) => b.size_in_bytes,
            ResourceKind::Texture(ref t) => {
                let mut total = 0;
                for mip in 0..t.mip_count {
                    let (_, _, d) = t.mip_dimensions(mip);
                    total += t.natural_pitches(mip).slice_pitch * d;
                }
                total * u32::from(t.array_count)
            }
        }
    }

    /// The texture description, if this describes a texture.
    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        match self.kind {
            ResourceKind::Texture(ref t) => Some(t),
            _ => None,
        }
    }

    /// Whether the resource can be mapped by the CPU.
    pub fn is_host_visible(&self) -> bool {
        self.allocation_rules
            .contains(AllocationRules::HOST_VISIBLE_SEQUENTIAL_WRITE)
    }
}

/// Location and layout of one subresource inside the tightly packed linear
/// arrangement of a whole texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceFootprint {
    /// Byte offset from the start of the linear arrangement.
    pub offset: u32,
    /// Byte size of the subresource.
    pub size: u32,
    /// Pitches of the subresource data.
    pub pitches: TexturePitches,
}

/// Compute the footprint of one subresource within the tightly packed layout
/// produced by laying out `array_layer`-major, `mip`-minor.
pub fn subresource_footprint(desc: &TextureDesc, id: SubresourceId) -> SubresourceFootprint {
    debug_assert!(id.mip < desc.mip_count && id.array_layer < desc.array_count);
    let layer_size: u32 = (0..desc.mip_count)
        .map(|mip| {
            let (_, _, d) = desc.mip_dimensions(mip);
            desc.natural_pitches(mip).slice_pitch * d
        })
        .sum();
    let mut offset = layer_size * u32::from(id.array_layer);
    for mip in 0..id.mip {
        let (_, _, d) = desc.mip_dimensions(mip);
        offset += desc.natural_pitches(mip).slice_pitch * d;
    }
    let pitches = desc.natural_pitches(id.mip);
    let (_, _, d) = desc.mip_dimensions(id.mip);
    SubresourceFootprint {
        offset,
        size: pitches.slice_pitch * d,
        pitches,
    }
}
