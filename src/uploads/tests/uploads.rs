//! End-to-end upload scenarios over the software backend.

mod common;

use common::{buffer_desc, pattern, Harness};
use freight_uploads::{
    BasicDataPacket, ManagerConfig, SubresourceWrite, TextureDataPacket, TransactionOptions,
    UploadError,
};
use futures_channel::oneshot;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hal::{
    AllocationRules, BindFlags, Format, ResourceDesc, SubresourceId, TextureDesc,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn small_buffer_round_trip() {
    let harness = Harness::new(1 << 20);
    let data = pattern(1024);
    let mut markers = vec![harness.manager.begin_packet(
        &buffer_desc(1024, "small-buffer"),
        BasicDataPacket::from_bytes(data.clone()),
        None,
        TransactionOptions::empty(),
    )];
    let locator = harness.complete_all(&mut markers).remove(0).unwrap();

    assert!(locator.completion_command_list() > 0);
    harness.stall(locator.completion_command_list());
    assert!(harness.manager.is_complete(locator.completion_command_list()));
    assert_eq!(harness.read_back(&locator), data);
}

#[test]
fn many_uploads_through_a_small_staging_page() {
    // eight 512 KiB uploads through a 1 MiB page: most of them back-pressure
    // and retry once earlier copies retire
    let harness = Harness::new(1 << 20);
    let payloads: Vec<Vec<u8>> = (0..8u8)
        .map(|i| vec![i ^ 0x5a; 512 * 1024])
        .collect();
    let mut markers: Vec<_> = payloads
        .iter()
        .map(|p| {
            harness.manager.begin_packet(
                &buffer_desc(p.len() as u32, "bulk"),
                BasicDataPacket::from_bytes(p.clone()),
                None,
                TransactionOptions::empty(),
            )
        })
        .collect();
    let locators: Vec<_> = harness
        .complete_all(&mut markers)
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let highest = locators
        .iter()
        .map(|l| l.completion_command_list())
        .max()
        .unwrap();
    harness.stall(highest);
    assert_eq!(harness.read_back(&locators[0]), payloads[0]);
    assert_eq!(harness.read_back(&locators[7]), payloads[7]);
}

struct SlowSource {
    desc: Mutex<Option<oneshot::Receiver<ResourceDesc>>>,
    payload: Vec<u8>,
}

impl freight_uploads::AsyncDataSource for SlowSource {
    fn desc(&self) -> BoxFuture<'static, Result<ResourceDesc, UploadError>> {
        let receiver = self.desc.lock().take().expect("desc queried once");
        async move {
            receiver
                .await
                .map_err(|_| UploadError::DataSource("descriptor source dropped".into()))
        }
        .boxed()
    }

    fn prepare_data(
        &self,
        mut destinations: Vec<SubresourceWrite>,
    ) -> BoxFuture<'static, Result<(), UploadError>> {
        assert_eq!(destinations.len(), 1);
        destinations[0].destination.fill_from(&self.payload);
        async { Ok(()) }.boxed()
    }
}

#[test]
fn async_source_with_delayed_descriptor() {
    let harness = Harness::new(1 << 20);
    let payload = pattern(4096);
    let (sender, receiver) = oneshot::channel();
    let source = Arc::new(SlowSource {
        desc: Mutex::new(Some(receiver)),
        payload: payload.clone(),
    });

    let mut markers = vec![harness.manager.begin_async(
        source,
        None,
        BindFlags::VERTEX_BUFFER,
        TransactionOptions::empty(),
    )];

    // let the transaction sit in the descriptor wait for a little while
    for _ in 0..5 {
        harness.update();
        std::thread::sleep(Duration::from_millis(1));
    }
    sender
        .send(buffer_desc(payload.len() as u32, "delayed"))
        .unwrap();

    let locator = harness.complete_all(&mut markers).remove(0).unwrap();
    harness.stall(locator.completion_command_list());
    assert_eq!(harness.read_back(&locator), payload);
}

struct NeverSource;

impl freight_uploads::AsyncDataSource for NeverSource {
    fn desc(&self) -> BoxFuture<'static, Result<ResourceDesc, UploadError>> {
        futures_util::future::pending().boxed()
    }

    fn prepare_data(
        &self,
        _destinations: Vec<SubresourceWrite>,
    ) -> BoxFuture<'static, Result<(), UploadError>> {
        async { Ok(()) }.boxed()
    }
}

#[test]
fn cancellation_before_the_descriptor_resolves() {
    let harness = Harness::new(1 << 20);
    let mut marker = harness.manager.begin_async(
        Arc::new(NeverSource),
        None,
        BindFlags::SHADER_RESOURCE,
        TransactionOptions::empty(),
    );
    harness.manager.cancel(&[marker.transaction_id]);

    let deadline = Instant::now() + Duration::from_millis(100);
    let mut outcome = None;
    while Instant::now() < deadline {
        harness.update();
        if let Ok(Some(result)) = marker.future.try_recv() {
            outcome = Some(result);
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(outcome, Some(Err(UploadError::Cancelled))));
}

#[test]
fn oversize_upload_routes_through_dedicated_staging() {
    // the request is four times the staging page
    let harness = Harness::new(1 << 20);
    let data = pattern(4 << 20);
    let mut markers = vec![harness.manager.begin_packet(
        &buffer_desc(data.len() as u32, "oversize"),
        BasicDataPacket::from_bytes(data.clone()),
        None,
        TransactionOptions::empty(),
    )];
    let locator = harness.complete_all(&mut markers).remove(0).unwrap();
    harness.stall(locator.completion_command_list());
    assert_eq!(harness.read_back(&locator), data);
}

#[test]
fn texture_upload_fills_every_subresource() {
    let harness = Harness::new(1 << 20);
    let texture = TextureDesc::plain_2d(16, 16, Format::Rgba8Unorm, 3);
    let subresources: Vec<Vec<u8>> = (0..3u8)
        .map(|mip| {
            let footprint =
                hal::desc::subresource_footprint(&texture, SubresourceId { mip, array_layer: 0 });
            vec![0x10 + mip; footprint.size as usize]
        })
        .collect();
    let desc = ResourceDesc::texture(
        BindFlags::SHADER_RESOURCE,
        AllocationRules::empty(),
        texture,
        "mipped",
    );
    let mut markers = vec![harness.manager.begin_packet(
        &desc,
        TextureDataPacket::new(texture, subresources.clone()),
        None,
        TransactionOptions::empty(),
    )];
    let locator = harness.complete_all(&mut markers).remove(0).unwrap();
    harness.stall(locator.completion_command_list());

    let bytes = harness.read_back(&locator);
    let f1 = hal::desc::subresource_footprint(&texture, SubresourceId { mip: 1, array_layer: 0 });
    assert_eq!(
        &bytes[f1.offset as usize..(f1.offset + f1.size) as usize],
        &subresources[1][..]
    );
}

#[test]
fn on_completion_fires_after_all_transactions_retire() {
    let harness = Harness::new(1 << 20);
    let mut markers: Vec<_> = (0..2)
        .map(|_| {
            harness.manager.begin_packet(
                &buffer_desc(256, "completion"),
                BasicDataPacket::from_bytes(pattern(256)),
                None,
                TransactionOptions::empty(),
            )
        })
        .collect();
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    harness.manager.on_completion(
        &[markers[0].transaction_id, markers[1].transaction_id],
        Box::new(move || flag.store(true, Ordering::SeqCst)),
    );

    let _ = harness.complete_all(&mut markers);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !fired.load(Ordering::SeqCst) {
        harness.update();
        assert!(Instant::now() < deadline, "completion callback never fired");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn immediate_transaction_is_synchronous() {
    let harness = Harness::new(1 << 20);
    let data = pattern(2048);
    let locator = harness
        .manager
        .immediate_transaction(
            &buffer_desc(2048, "immediate"),
            &*BasicDataPacket::from_bytes(data.clone()),
        )
        .unwrap();
    // no stalling required; the contents are visible on return
    assert_eq!(harness.read_back(&locator), data);
}

#[test]
fn upload_into_an_existing_resource() {
    let harness = Harness::new(1 << 20);
    let first = pattern(1024);
    let mut markers = vec![harness.manager.begin_packet(
        &buffer_desc(1024, "target"),
        BasicDataPacket::from_bytes(first),
        None,
        TransactionOptions::empty(),
    )];
    let target = harness.complete_all(&mut markers).remove(0).unwrap();
    harness.stall(target.completion_command_list());

    let replacement = vec![0xeeu8; 1024];
    let mut markers = vec![harness.manager.begin_into_packet(
        target.clone(),
        BasicDataPacket::from_bytes(replacement.clone()),
        TransactionOptions::empty(),
    )];
    let rewritten = harness.complete_all(&mut markers).remove(0).unwrap();
    harness.stall(rewritten.completion_command_list());
    assert_eq!(harness.read_back(&target), replacement);
}

#[test]
fn metrics_record_uploaded_bytes() {
    let harness = Harness::new(1 << 20);
    let mut markers = vec![harness.manager.begin_packet(
        &buffer_desc(4096, "measured"),
        BasicDataPacket::from_bytes(pattern(4096)),
        None,
        TransactionOptions::empty(),
    )];
    let locator = harness.complete_all(&mut markers).remove(0).unwrap();
    harness.stall(locator.completion_command_list());

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let metrics = harness.manager.pop_metrics();
        if metrics.is_valid() && metrics.bytes_upload_total >= 4096 {
            assert!(metrics.total_count_uploaded() >= 1);
            break;
        }
        harness.update();
        assert!(Instant::now() < deadline, "metrics never surfaced");
    }
}

#[test]
fn frame_priority_work_overtakes_the_main_queue() {
    // single threaded keeps the scheduling deterministic: nothing processes
    // until update drives the foreground context
    let harness = Harness::with_config(ManagerConfig {
        staging_page_size: 1 << 20,
        background_thread: Some(false),
        ..ManagerConfig::default()
    });

    let mut main_markers: Vec<_> = (0..40)
        .map(|_| {
            harness.manager.begin_packet(
                &buffer_desc(1024, "main"),
                BasicDataPacket::from_bytes(pattern(1024)),
                None,
                TransactionOptions::empty(),
            )
        })
        .collect();
    harness.manager.frame_priority_barrier();
    let mut priority_markers: Vec<_> = (0..10)
        .map(|_| {
            harness.manager.begin_packet(
                &buffer_desc(1024, "priority"),
                BasicDataPacket::from_bytes(pattern(1024)),
                None,
                TransactionOptions::FRAME_PRIORITY,
            )
        })
        .collect();

    let priority_ids: Vec<_> = harness
        .complete_all(&mut priority_markers)
        .into_iter()
        .map(|r| r.unwrap().completion_command_list())
        .collect();
    let main_ids: Vec<_> = harness
        .complete_all(&mut main_markers)
        .into_iter()
        .map(|r| r.unwrap().completion_command_list())
        .collect();

    let max_priority = priority_ids.iter().copied().max().unwrap();
    assert!(
        main_ids.iter().all(|&id| id >= max_priority),
        "main ids {:?} retired ahead of frame priority ids {:?}",
        main_ids,
        priority_ids
    );
}

#[test]
fn background_frame_callback_runs() {
    let harness = Harness::new(1 << 20);
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let marker = harness
        .manager
        .bind_on_background_frame(Box::new(move || flag.store(true, Ordering::SeqCst)));

    let mut markers = vec![harness.manager.begin_packet(
        &buffer_desc(128, "nudge"),
        BasicDataPacket::from_bytes(pattern(128)),
        None,
        TransactionOptions::empty(),
    )];
    let _ = harness.complete_all(&mut markers);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !fired.load(Ordering::SeqCst) {
        harness.update();
        assert!(Instant::now() < deadline, "background frame callback never ran");
        std::thread::sleep(Duration::from_millis(1));
    }
    harness.manager.unbind_on_background_frame(marker);
}

#[test]
fn async_upload_into_an_existing_resource() {
    let harness = Harness::new(1 << 20);
    let original = pattern(2048);
    let mut markers = vec![harness.manager.begin_packet(
        &buffer_desc(2048, "async-target"),
        BasicDataPacket::from_bytes(original),
        None,
        TransactionOptions::empty(),
    )];
    let target = harness.complete_all(&mut markers).remove(0).unwrap();
    harness.stall(target.completion_command_list());

    let replacement = vec![0x77u8; 2048];
    let (sender, receiver) = oneshot::channel();
    let source = Arc::new(SlowSource {
        desc: Mutex::new(Some(receiver)),
        payload: replacement.clone(),
    });
    let mut markers = vec![harness.manager.begin_into_async(
        target.clone(),
        source,
        TransactionOptions::empty(),
    )];
    sender
        .send(buffer_desc(2048, "async-replacement"))
        .unwrap();
    let rewritten = harness.complete_all(&mut markers).remove(0).unwrap();
    harness.stall(rewritten.completion_command_list());
    assert_eq!(harness.read_back(&target), replacement);
}

#[test]
fn cancel_after_completion_is_ignored() {
    let harness = Harness::new(1 << 20);
    let mut markers = vec![harness.manager.begin_packet(
        &buffer_desc(512, "done-before-cancel"),
        BasicDataPacket::from_bytes(pattern(512)),
        None,
        TransactionOptions::empty(),
    )];
    let id = markers[0].transaction_id;
    let locator = harness.complete_all(&mut markers).remove(0).unwrap();
    harness.stall(locator.completion_command_list());

    // the transaction has retired; its slot may even have been reused by
    // now, and the stale id must not disturb anything
    harness.manager.cancel(&[id]);
    for _ in 0..4 {
        harness.update();
    }
    assert_eq!(harness.read_back(&locator), pattern(512));
}
