//! Pixel formats, reduced to what upload-size arithmetic needs.

/// Texel format of a texture resource.
///
/// Only the formats the upload subsystem is exercised with are listed; the
/// host's format utilities own the full table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Format {
    /// Single 8-bit unsigned normalized channel.
    R8Unorm,
    /// Two 8-bit unsigned normalized channels.
    Rg8Unorm,
    /// Four 8-bit unsigned normalized channels.
    Rgba8Unorm,
    /// Four 8-bit channels, sRGB encoded.
    Rgba8Srgb,
    /// Single 16-bit unsigned integer channel.
    R16Uint,
    /// Single 32-bit unsigned integer channel.
    R32Uint,
    /// Single 32-bit float channel.
    R32Float,
    /// Four 16-bit float channels.
    Rgba16Float,
    /// Four 32-bit float channels.
    Rgba32Float,
}

impl Format {
    /// Bytes per texel.
    pub fn texel_size(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Uint => 2,
            Format::Rgba8Unorm | Format::Rgba8Srgb | Format::R32Uint | Format::R32Float => 4,
            Format::Rgba16Float => 8,
            Format::Rgba32Float => 16,
        }
    }
}
