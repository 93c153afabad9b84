//! Initialisation data: synchronous packets and asynchronous sources.

use crate::error::UploadError;
use futures_util::future::BoxFuture;
use hal::{
    ResourceDesc, ResourceInitializer, SubresourceId, SubresourceInitData, TextureDesc,
    TexturePitches,
};
use std::sync::Arc;

/// Synchronous initialisation data for a resource, one blob per subresource.
pub trait DataPacket: Send + Sync {
    /// The bytes of the given subresource; empty when the packet carries no
    /// data for it.
    fn data(&self, subres: SubresourceId) -> &[u8];

    /// Layout of the subresource bytes.
    fn pitches(&self, subres: SubresourceId) -> TexturePitches;
}

/// Adapts a `DataPacket` to the device's resource-initialiser interface.
pub struct PacketInitializer<'a>(pub &'a dyn DataPacket);

impl<'a> ResourceInitializer for PacketInitializer<'a> {
    fn init_data(&self, subres: SubresourceId) -> SubresourceInitData<'_> {
        SubresourceInitData {
            data: self.0.data(subres),
            pitches: self.0.pitches(subres),
        }
    }
}

/// A packet holding a single linear blob (subresource zero).
pub struct BasicDataPacket {
    data: Vec<u8>,
    pitches: TexturePitches,
}

impl BasicDataPacket {
    /// Wrap owned bytes with explicit pitches.
    pub fn new(data: Vec<u8>, pitches: TexturePitches) -> Arc<Self> {
        Arc::new(BasicDataPacket { data, pitches })
    }

    /// Wrap owned bytes with no texture layout (plain buffer data).
    pub fn from_bytes(data: Vec<u8>) -> Arc<Self> {
        Self::new(data, TexturePitches::default())
    }
}

impl DataPacket for BasicDataPacket {
    fn data(&self, subres: SubresourceId) -> &[u8] {
        if subres == SubresourceId::default() {
            &self.data
        } else {
            &[]
        }
    }

    fn pitches(&self, _subres: SubresourceId) -> TexturePitches {
        self.pitches
    }
}

/// A packet holding one blob per texture subresource, mip-major within each
/// array layer.
pub struct TextureDataPacket {
    desc: TextureDesc,
    subresources: Vec<Vec<u8>>,
}

impl TextureDataPacket {
    /// Wrap per-subresource blobs; `subresources[layer * mip_count + mip]`.
    pub fn new(desc: TextureDesc, subresources: Vec<Vec<u8>>) -> Arc<Self> {
        debug_assert_eq!(subresources.len() as u32, desc.subresource_count());
        Arc::new(TextureDataPacket { desc, subresources })
    }

    fn index(&self, subres: SubresourceId) -> usize {
        usize::from(subres.array_layer) * usize::from(self.desc.mip_count)
            + usize::from(subres.mip)
    }
}

impl DataPacket for TextureDataPacket {
    fn data(&self, subres: SubresourceId) -> &[u8] {
        match self.subresources.get(self.index(subres)) {
            Some(blob) => blob,
            None => &[],
        }
    }

    fn pitches(&self, subres: SubresourceId) -> TexturePitches {
        self.desc.natural_pitches(subres.mip)
    }
}

/// A packet that carries no data at all; the resource is created
/// uninitialised.
pub struct EmptyDataPacket;

impl DataPacket for EmptyDataPacket {
    fn data(&self, _subres: SubresourceId) -> &[u8] {
        &[]
    }

    fn pitches(&self, _subres: SubresourceId) -> TexturePitches {
        TexturePitches::default()
    }
}

/// Opaque invalidation handle reported by asynchronous sources; collaborators
/// outside the core interpret it.
pub type DependencyValidation = u64;

/// A mutable destination range inside mapped staging memory.
///
/// Only the upload core constructs these; the pointer stays valid until the
/// prepare future completes because the staging allocation it points into is
/// held for at least that long.
pub struct StagingDestination {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for StagingDestination {}

impl StagingDestination {
    pub(crate) fn new(ptr: *mut u8, len: usize) -> Self {
        StagingDestination { ptr, len }
    }

    /// Writable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the destination is zero sized.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the destination, starting at `offset`. Panics if the
    /// copy would run past the end.
    pub fn write(&mut self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len());
        }
    }

    /// Fill the whole destination from `src`, which must match its length.
    pub fn fill_from(&mut self, src: &[u8]) {
        assert_eq!(src.len(), self.len);
        self.write(0, src);
    }
}

/// One subresource the source must fill during `prepare_data`.
pub struct SubresourceWrite {
    /// Which subresource the destination belongs to.
    pub id: SubresourceId,
    /// Where to write the subresource bytes.
    pub destination: StagingDestination,
    /// Layout the destination expects.
    pub pitches: TexturePitches,
}

/// Asynchronous initialisation data: the descriptor and the data bytes each
/// arrive through a future.
pub trait AsyncDataSource: Send + Sync {
    /// Resolve the descriptor of the resource this source produces.
    fn desc(&self) -> BoxFuture<'static, Result<ResourceDesc, UploadError>>;

    /// Fill the given staging destinations with subresource data.
    fn prepare_data(
        &self,
        destinations: Vec<SubresourceWrite>,
    ) -> BoxFuture<'static, Result<(), UploadError>>;

    /// Invalidation handle for hot-reload style collaborators.
    fn dependency_validation(&self) -> DependencyValidation {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::Format;

    #[test]
    fn basic_packet_serves_subresource_zero_only() {
        let packet = BasicDataPacket::from_bytes(vec![1, 2, 3]);
        assert_eq!(packet.data(SubresourceId::default()), &[1, 2, 3]);
        assert!(packet
            .data(SubresourceId { mip: 1, array_layer: 0 })
            .is_empty());
    }

    #[test]
    fn texture_packet_indexes_mip_major() {
        let desc = TextureDesc::plain_2d(4, 4, Format::R8Unorm, 2);
        let packet = TextureDataPacket::new(desc, vec![vec![0xa; 16], vec![0xb; 4]]);
        assert_eq!(packet.data(SubresourceId { mip: 1, array_layer: 0 }), &[0xb; 4][..]);
        assert_eq!(
            packet.pitches(SubresourceId { mip: 0, array_layer: 0 }).row_pitch,
            4
        );
    }

    #[test]
    fn staging_destination_bounds_checked() {
        let mut bytes = [0u8; 8];
        let mut dest = StagingDestination::new(bytes.as_mut_ptr(), bytes.len());
        dest.write(4, &[9, 9]);
        assert_eq!(bytes[4], 9);
        assert_eq!(bytes[3], 0);
    }
}
