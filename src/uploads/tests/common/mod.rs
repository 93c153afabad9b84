//! Shared harness: a manager over the software backend plus readback
//! helpers.

use freight_backend_soft::SoftDevice;
use freight_uploads::{
    create_manager, Manager, ManagerConfig, ResourceLocator, TransactionMarker, TransactionResult,
};
use hal::{
    AllocationRules, BindFlags, BufferCopy, Device, QueueClass, ResourceDesc,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Harness {
    pub device: Arc<SoftDevice>,
    pub manager: Arc<dyn Manager>,
}

impl Harness {
    pub fn new(staging_page_size: u32) -> Self {
        Self::with_config(ManagerConfig {
            staging_page_size,
            ..ManagerConfig::default()
        })
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = SoftDevice::new();
        let manager = create_manager(Arc::clone(&device) as Arc<dyn Device>, config).unwrap();
        Harness { device, manager }
    }

    /// One frame: drive the manager and submit the frame's graphics work.
    pub fn update(&self) {
        let mut immediate = self.device.open_command_writer(QueueClass::Graphics);
        self.manager.update(&mut *immediate);
        let list = immediate.resolve();
        self.device
            .queue(QueueClass::Graphics)
            .submit(list)
            .unwrap();
    }

    pub fn stall(&self, id: freight_uploads::CommandListId) {
        let mut immediate = self.device.open_command_writer(QueueClass::Graphics);
        self.manager.stall_until_completion(&mut *immediate, id);
        let list = immediate.resolve();
        self.device
            .queue(QueueClass::Graphics)
            .submit(list)
            .unwrap();
    }

    /// Drive updates until every marker resolves; panics after five seconds.
    pub fn complete_all(&self, markers: &mut [TransactionMarker]) -> Vec<TransactionResult> {
        let mut results: Vec<Option<TransactionResult>> = markers.iter().map(|_| None).collect();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            self.update();
            for (marker, slot) in markers.iter_mut().zip(results.iter_mut()) {
                if slot.is_none() {
                    if let Ok(Some(result)) = marker.future.try_recv() {
                        *slot = Some(result);
                    }
                }
            }
            if results.iter().all(|r| r.is_some()) {
                return results.into_iter().map(|r| r.unwrap()).collect();
            }
            assert!(Instant::now() < deadline, "uploads never completed");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Read a locator's bytes back through a host-visible staging copy.
    pub fn read_back(&self, locator: &ResourceLocator) -> Vec<u8> {
        let (start, end) = locator.range_in_containing_resource();
        let size = (end - start) as u32;
        let readback_desc = ResourceDesc::linear_buffer(
            BindFlags::TRANSFER_DST,
            AllocationRules::HOST_VISIBLE_SEQUENTIAL_WRITE,
            size,
            "readback",
        );
        let readback = self.device.create_resource(&readback_desc, None).unwrap();
        let mut writer = self.device.open_command_writer(QueueClass::Graphics);
        writer.copy_buffer(
            locator.containing_resource().unwrap(),
            &readback,
            &[BufferCopy {
                src_offset: start as u32,
                dst_offset: 0,
                size,
            }],
        );
        let list = writer.resolve();
        self.device
            .queue(QueueClass::Graphics)
            .submit(list)
            .unwrap();
        let mut out = vec![0u8; size as usize];
        readback.read_via_map(0, &mut out).unwrap();
        out
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i & 0xff) as u8).collect()
}

pub fn buffer_desc(size: u32, name: &'static str) -> ResourceDesc {
    ResourceDesc::linear_buffer(
        BindFlags::VERTEX_BUFFER,
        AllocationRules::empty(),
        size,
        name,
    )
}
