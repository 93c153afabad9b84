//! Per-command-list metrics and the retirement log.

use hal::{BindFlags, ResourceDesc, ResourceKind};
use smallvec::SmallVec;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microsecond timestamp used across the metrics records; zero means unset.
pub type TimeMarker = u64;

/// The current time as a `TimeMarker`.
pub fn time_marker_now() -> TimeMarker {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(1)
}

/// Coarse classification of uploaded data, used to bucket the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadDataType {
    /// Texture contents.
    Texture = 0,
    /// Vertex or index buffer contents.
    GeometryBuffer = 1,
    /// Uniform/constant buffer contents.
    UniformBuffer = 2,
}

/// Number of `UploadDataType` buckets.
pub const UPLOAD_DATA_TYPE_COUNT: usize = 3;

/// Classify a descriptor into a metrics bucket.
pub fn upload_data_type(desc: &ResourceDesc, extra_bind_flags: BindFlags) -> UploadDataType {
    match desc.kind {
        ResourceKind::LinearBuffer(_) => {
            if (desc.bind_flags | extra_bind_flags)
                .intersects(BindFlags::VERTEX_BUFFER | BindFlags::INDEX_BUFFER)
            {
                UploadDataType::GeometryBuffer
            } else {
                UploadDataType::UniformBuffer
            }
        }
        ResourceKind::Texture(_) => UploadDataType::Texture,
    }
}

/// Occupancy of the staging page at metrics-collection time.
#[derive(Clone, Copy, Debug, Default)]
pub struct StagingPageMetrics {
    /// Bytes currently allocated in the circular heap.
    pub bytes_allocated: u32,
    /// Largest allocation that could succeed right now.
    pub max_next_block_bytes: u32,
    /// Bytes released but still waiting for the device to advance.
    pub bytes_awaiting_device: u32,
    /// Bytes released out of order, locked until earlier allocations release.
    pub bytes_locked_due_to_ordering: u32,
}

/// Queue depths and totals across the assembly line.
#[derive(Clone, Debug, Default)]
pub struct AssemblyLineMetrics {
    /// Transactions currently allocated.
    pub transaction_count: u32,
    /// Size of the transaction table (high-water, never shrinks).
    pub temporary_transactions_allocated: u32,
    /// Steps waiting in the prepare-staging queues.
    pub queued_prepare_staging: u32,
    /// Steps waiting in the transfer queues.
    pub queued_transfer_staging_to_final: u32,
    /// Steps waiting in the create-from-packet queues.
    pub queued_create_from_data_packet: u32,
    /// Peak of `queued_prepare_staging` since startup.
    pub peak_prepare_staging: u32,
    /// Peak of `queued_transfer_staging_to_final` since startup.
    pub peak_transfer_staging_to_final: u32,
    /// Peak of `queued_create_from_data_packet` since startup.
    pub peak_create_from_data_packet: u32,
    /// Queued-but-unprocessed bytes per data type.
    pub queued_bytes: [u64; UPLOAD_DATA_TYPE_COUNT],
    /// Staging page occupancy.
    pub staging_page_metrics: StagingPageMetrics,
}

/// One retired transaction, for the retirement log.
#[derive(Clone, Debug)]
pub struct Retirement {
    /// Descriptor of the retired resource.
    pub desc: ResourceDesc,
    /// When the transaction was begun.
    pub request_time: TimeMarker,
    /// When the transaction retired.
    pub retirement_time: TimeMarker,
}

/// Everything measured about one resolved command list.
#[derive(Clone, Debug, Default)]
pub struct CommandListMetrics {
    /// Bytes uploaded, per data type.
    pub bytes_uploaded: [u64; UPLOAD_DATA_TYPE_COUNT],
    /// Bytes of resources created, per data type.
    pub bytes_created: [u64; UPLOAD_DATA_TYPE_COUNT],
    /// Bytes of staging space consumed, per data type.
    pub staging_bytes_allocated: [u64; UPLOAD_DATA_TYPE_COUNT],
    /// Total bytes uploaded by this command list.
    pub bytes_upload_total: u64,
    /// Resources created, per data type.
    pub count_creations: [u32; UPLOAD_DATA_TYPE_COUNT],
    /// Resources created by the device (not a pool), per data type.
    pub count_device_creations: [u32; UPLOAD_DATA_TYPE_COUNT],
    /// Uploads completed, per data type.
    pub count_uploaded: [u32; UPLOAD_DATA_TYPE_COUNT],
    /// Operations recorded into the command list.
    pub context_operations: u32,
    /// Device create calls made while building the command list.
    pub device_create_operations: u32,
    /// Assembly-line snapshot taken at resolve time.
    pub assembly_line_metrics: AssemblyLineMetrics,
    /// Transactions retired while this command list was under construction.
    pub retirements: SmallVec<[Retirement; 16]>,
    /// When the command list was resolved; zero until then.
    pub resolve_time: TimeMarker,
    /// When the command list was committed toward the graphics queue; zero
    /// until then. `PopMetrics` uses this as its validity flag.
    pub commit_time: TimeMarker,
    /// Time the background thread spent asleep during construction.
    pub wait_time: TimeMarker,
    /// When construction of this command list began.
    pub processing_start: TimeMarker,
    /// When construction ended.
    pub processing_end: TimeMarker,
    /// Time spent stalling for frame-priority commits.
    pub frame_priority_stall_time: TimeMarker,
    /// Times the background thread woke during construction.
    pub wake_count: u32,
    /// Frame the command list was committed in.
    pub frame_id: u32,
    /// Failure text from graphics-queue-side exceptions, if any.
    pub failure_message: String,
}

impl CommandListMetrics {
    /// Whether this record came from a real command list (see `commit_time`).
    pub fn is_valid(&self) -> bool {
        self.commit_time != 0
    }

    /// Total uploads across all data types.
    pub fn total_count_uploaded(&self) -> u32 {
        self.count_uploaded.iter().sum()
    }
}

impl fmt::Display for CommandListMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "command list: {} ops, {} bytes uploaded, {} retirements",
            self.context_operations,
            self.bytes_upload_total,
            self.retirements.len()
        )?;
        let names = ["textures", "geometry", "uniforms"];
        for (i, name) in names.iter().enumerate() {
            if self.count_uploaded[i] != 0 || self.count_creations[i] != 0 {
                writeln!(
                    f,
                    "  {}: {} uploads ({} bytes), {} creations ({} device)",
                    name,
                    self.count_uploaded[i],
                    self.bytes_uploaded[i],
                    self.count_creations[i],
                    self.count_device_creations[i]
                )?;
            }
        }
        if !self.failure_message.is_empty() {
            writeln!(f, "  failures: {}", self.failure_message)?;
        }
        Ok(())
    }
}

/// Append `message` to the failure text, comma separated.
pub fn append_failure(metrics: &mut CommandListMetrics, message: &str) {
    if !metrics.failure_message.is_empty() {
        metrics.failure_message.push_str(", ");
    }
    metrics.failure_message.push_str(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::AllocationRules;

    #[test]
    fn data_type_classification_follows_bind_flags() {
        let vb = ResourceDesc::linear_buffer(
            BindFlags::VERTEX_BUFFER,
            AllocationRules::empty(),
            64,
            "vb",
        );
        let cb = ResourceDesc::linear_buffer(
            BindFlags::CONSTANT_BUFFER,
            AllocationRules::empty(),
            64,
            "cb",
        );
        assert_eq!(
            upload_data_type(&vb, BindFlags::empty()),
            UploadDataType::GeometryBuffer
        );
        assert_eq!(
            upload_data_type(&cb, BindFlags::empty()),
            UploadDataType::UniformBuffer
        );
        // extra bind flags can promote a plain buffer to geometry
        assert_eq!(
            upload_data_type(&cb, BindFlags::INDEX_BUFFER),
            UploadDataType::GeometryBuffer
        );
    }
}
