// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end scenario tests driving the admin-path entities and the SCSI
//! command path together, using the shared fakes in `dedupv1d::testing`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use dedupv1d::dedup_engine::DedupVolume;
use dedupv1d::dedup_engine::StartContext;
use dedupv1d::detacher::AlwaysIdle;
use dedupv1d::detacher::VolumeDetacher;
use dedupv1d::fastcopy::FastCopyEngine;
use dedupv1d::fastcopy::JobData;
use dedupv1d::fastcopy::VolumeLookup;
use dedupv1d::kernel_bridge::BridgeEvent;
use dedupv1d::kernel_bridge::TaskManagementFunction;
use dedupv1d::persistence::InMemoryIndex;
use dedupv1d::persistence::InMemoryInfoStore;
use dedupv1d::scsi::constants::ILLEGAL_REQUEST;
use dedupv1d::scsi::constants::NOT_READY;
use dedupv1d::scsi::constants::READ_10;
use dedupv1d::scsi::constants::UNIT_ATTENTION;
use dedupv1d::scsi::constants::WRITE_10;
use dedupv1d::testing::CountingDedupSystem;
use dedupv1d::testing::MemoryDedupVolume;
use dedupv1d::testing::ScriptedBridge;
use dedupv1d::volume::Volume;
use dedupv1d::volume::VolumeCreateOptions;

fn write_10(lba: u32, sectors: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = WRITE_10;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&sectors.to_be_bytes());
    cdb
}

fn read_10(lba: u32, sectors: u16) -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = READ_10;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&sectors.to_be_bytes());
    cdb
}

fn make_volume(id: u32, logical_size: u64, backend: Arc<MemoryDedupVolume>) -> Arc<Volume> {
    Arc::new(
        Volume::new(
            VolumeCreateOptions {
                id,
                device_name: None,
                logical_size,
                sector_size: Some(512),
                command_thread_count: Some(2),
                preconfigured: false,
            },
            backend,
            ScriptedBridge::empty(),
            Arc::new(InMemoryInfoStore::new()),
        )
        .unwrap(),
    )
}

fn poll_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn write_then_read_roundtrip() {
    let backend = MemoryDedupVolume::new(64 * 1024);
    let volume = make_volume(1, 64 * 1024, backend.clone());
    volume.start(StartContext::default()).unwrap();
    volume.run().unwrap();

    let handler = volume.command_handler();
    let store = InMemoryInfoStore::new();
    let session = handler.attach_session(1).session_id;

    let payload = vec![0x5Au8; 512 * 4];
    let cdb = write_10(0, 4);
    let (sense, _) = handler.execute(session, 1, &cdb, &payload, payload.len(), &store);
    assert!(sense.is_ok());

    let cdb = read_10(0, 4);
    let (sense, reply) = handler.execute(session, 2, &cdb, &[], payload.len(), &store);
    assert!(sense.is_ok());
    assert_eq!(reply, payload);

    volume.stop().unwrap();
}

#[test]
fn write_close_restart_dirty_then_read() {
    // The backend is shared across two `Volume` instances to stand in for
    // the dedup engine state surviving a process restart; `dirty: true`
    // models attaching after an unclean shutdown.
    let backend = MemoryDedupVolume::new(4096);
    let volume = make_volume(5, 4096, backend.clone());
    volume.start(StartContext::default()).unwrap();
    volume.run().unwrap();

    let handler = volume.command_handler();
    let store = InMemoryInfoStore::new();
    let session = handler.attach_session(1).session_id;
    let payload = vec![0x11u8; 512];
    let (sense, _) = handler.execute(session, 1, &write_10(0, 1), &payload, 512, &store);
    assert!(sense.is_ok());

    volume.stop().unwrap();

    let restarted = make_volume(5, 4096, backend.clone());
    restarted
        .start(StartContext {
            create: false,
            dirty: true,
        })
        .unwrap();
    restarted.run().unwrap();

    let handler = restarted.command_handler();
    let session = handler.attach_session(1).session_id;
    let (sense, reply) = handler.execute(session, 2, &read_10(0, 1), &[], 512, &store);
    assert!(sense.is_ok());
    assert_eq!(reply, payload);

    restarted.stop().unwrap();
}

#[test]
fn out_of_range_read_is_illegal_request() {
    let backend = MemoryDedupVolume::new(4096);
    let volume = make_volume(2, 4096, backend);
    volume.start(StartContext::default()).unwrap();
    volume.run().unwrap();

    let handler = volume.command_handler();
    let store = InMemoryInfoStore::new();
    let session = handler.attach_session(1).session_id;

    // 4096 bytes is 8 sectors of 512; LBA 10 is past the end of the volume.
    let (sense, _) = handler.execute(session, 1, &read_10(10, 1), &[], 512, &store);
    assert_eq!(sense.key, ILLEGAL_REQUEST);

    volume.stop().unwrap();
}

#[test]
fn write_failure_flips_maintenance_and_raises_unit_attention_for_every_session() {
    let backend = MemoryDedupVolume::new(4096);
    let volume = make_volume(3, 4096, backend.clone());
    volume.start(StartContext::default()).unwrap();
    volume.run().unwrap();

    let handler = volume.command_handler();
    let store = InMemoryInfoStore::new();
    let writer = handler.attach_session(1).session_id;
    let bystander = handler.attach_session(2).session_id;

    backend.fail_next_request();
    let (sense, _) = handler.execute(writer, 1, &write_10(0, 1), &[0u8; 512], 512, &store);
    assert!(!sense.is_ok());
    assert!(volume.is_maintenance());

    // Every attached session, not just the one that hit the failure, sees
    // the pending unit attention on its next command.
    let (sense, _) = handler.execute(bystander, 1, &read_10(0, 1), &[], 512, &store);
    assert_eq!(sense.key, UNIT_ATTENTION);

    // Maintenance now rejects ordinary I/O outright.
    let (sense, _) = handler.execute(writer, 2, &read_10(0, 1), &[], 512, &store);
    assert_eq!(sense.key, NOT_READY);

    volume.stop().unwrap();
}

#[test]
fn change_maintenance_mode_rejects_io_and_is_idempotent() {
    let backend = MemoryDedupVolume::new(4096);
    let volume = make_volume(4, 4096, backend);
    volume.start(StartContext::default()).unwrap();
    volume.run().unwrap();

    volume.change_maintenance_mode(true).unwrap();
    assert!(volume.is_maintenance());
    volume.change_maintenance_mode(true).unwrap();
    assert!(volume.is_maintenance());

    let handler = volume.command_handler();
    let store = InMemoryInfoStore::new();
    let session = handler.attach_session(1).session_id;
    // Consume the unit attention raised by the flip itself.
    let _ = handler.execute(session, 1, &read_10(0, 1), &[], 512, &store);
    let (sense, _) = handler.execute(session, 2, &read_10(0, 1), &[], 512, &store);
    assert_eq!(sense.key, NOT_READY);

    volume.stop().unwrap();
}

#[test]
fn detach_blocks_reuse_until_fully_detached() {
    let dedup_system = CountingDedupSystem::new();
    let detacher = VolumeDetacher::new(
        Arc::new(InMemoryIndex::new()),
        dedup_system.clone(),
        Arc::new(AlwaysIdle),
    );
    detacher.start().unwrap();
    detacher.run().unwrap();

    detacher
        .detach_volume(7, "dedupv1-7".to_string(), 4096, (0, 6))
        .unwrap();
    assert!(detacher.is_detaching(7));

    let finished = poll_until(Duration::from_secs(2), || !detacher.is_detaching(7));
    assert!(finished, "volume 7 should finish detaching within the timeout");
    assert_eq!(dedup_system.deletes.load(std::sync::atomic::Ordering::SeqCst), 6);

    // A volume id can be reused for a fresh attach only once it is no
    // longer in the detaching index.
    detacher
        .detach_volume(7, "dedupv1-7".to_string(), 4096, (0, 1))
        .unwrap();
    assert!(detacher.is_detaching(7));

    detacher.stop();
}

struct MapVolumeLookup {
    volumes: HashMap<u32, Arc<MemoryDedupVolume>>,
}

impl VolumeLookup for MapVolumeLookup {
    fn dedup_volume(&self, volume_id: u32) -> Option<Arc<dyn DedupVolume>> {
        self.volumes.get(&volume_id).map(|v| v.clone() as Arc<dyn DedupVolume>)
    }
}

#[test]
fn fast_copy_job_runs_to_completion() {
    let source = MemoryDedupVolume::new(4096);
    let target = MemoryDedupVolume::new(4096);
    {
        let mut data = vec![0u8; 512];
        let mut ctx = dedupv1d::dedup_engine::ErrorContext::new();
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        source.make_request(dedupv1d::dedup_engine::RequestType::Write, 0, data.len(), &mut data, &mut ctx);
    }

    let mut volumes = HashMap::new();
    volumes.insert(1u32, source.clone());
    volumes.insert(2u32, target.clone());
    let lookup = Arc::new(MapVolumeLookup { volumes });

    let info_store = Arc::new(InMemoryInfoStore::new());
    let engine = FastCopyEngine::new(info_store, lookup);
    engine.start().unwrap();
    engine.run();

    engine
        .start_new_job(JobData {
            source_id: 1,
            target_id: 2,
            src_start: 0,
            tgt_start: 0,
            size: 512,
            current_offset: 0,
            job_failed: false,
        })
        .unwrap();
    assert!(engine.is_fast_copy_target(2));

    let finished = poll_until(Duration::from_secs(2), || !engine.is_fast_copy_target(2));
    assert!(finished, "fast-copy job should finish within the timeout");

    let mut read_back = vec![0u8; 512];
    let mut ctx = dedupv1d::dedup_engine::ErrorContext::new();
    target.make_request(dedupv1d::dedup_engine::RequestType::Read, 0, 512, &mut read_back, &mut ctx);
    let mut expected = vec![0u8; 512];
    for (i, b) in expected.iter_mut().enumerate() {
        *b = i as u8;
    }
    assert_eq!(read_back, expected);

    engine.stop();
}

#[test]
fn scripted_bridge_drives_volume_worker_loop() {
    let backend = MemoryDedupVolume::new(4096);
    let payload = vec![0x42u8; 512];
    let events = vec![
        BridgeEvent::AttachSession { session_id: 9 },
        BridgeEvent::Execute {
            session_id: 9,
            command_id: 1,
            cdb: write_10(0, 1).to_vec(),
            data_out: payload.clone(),
            alloc_len: 512,
        },
        BridgeEvent::TaskManagementReceived {
            session_id: 9,
            function: TaskManagementFunction::AbortTask,
        },
        BridgeEvent::DetachSession { session_id: 9 },
    ];
    // `ScriptedBridge::handle_process_command` pops from the back, so the
    // script is pushed in reverse so events are delivered in order.
    let mut reversed = events;
    reversed.reverse();
    let bridge = ScriptedBridge::new(reversed);

    let volume = Arc::new(
        Volume::new(
            VolumeCreateOptions {
                id: 6,
                device_name: None,
                logical_size: 4096,
                sector_size: Some(512),
                command_thread_count: Some(1),
                preconfigured: false,
            },
            backend.clone(),
            bridge,
            Arc::new(InMemoryInfoStore::new()),
        )
        .unwrap(),
    );
    volume.start(StartContext::default()).unwrap();
    volume.run().unwrap();

    let committed = poll_until(Duration::from_secs(2), || {
        let mut data = vec![0u8; 512];
        let mut ctx = dedupv1d::dedup_engine::ErrorContext::new();
        backend.make_request(dedupv1d::dedup_engine::RequestType::Read, 0, 512, &mut data, &mut ctx);
        data == payload
    });
    assert!(committed, "scripted write should land in the backend");

    volume.stop().unwrap();
}
