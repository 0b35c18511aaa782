// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `dedupv1d`: the iSCSI/SCSI deduplicated block target daemon. Parses
//! flags, loads the configuration, wires up the group/user/target/volume
//! registries and the background subsystems, then runs until a shutdown
//! signal (§4.5, ADDED CLI entry point).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use base::info;
use base::syslog;
use base::syslog::LogConfig;
use base::Event;
use dedupv1d::backends::NullDedupSystem;
use dedupv1d::backends::NullDedupVolume;
use dedupv1d::backends::NullKernelBridge;
use dedupv1d::config::parse_params;
use dedupv1d::config::Config;
use dedupv1d::dedup_engine::DedupSystem;
use dedupv1d::dedup_engine::DedupVolume;
use dedupv1d::dedup_engine::StartContext;
use dedupv1d::detacher::AlwaysIdle;
use dedupv1d::detacher::VolumeDetacher;
use dedupv1d::fastcopy::FastCopyEngine;
use dedupv1d::fastcopy::VolumeLookup;
use dedupv1d::group_info::GroupInfo;
use dedupv1d::kernel_bridge::KernelScsiBridge;
use dedupv1d::persistence::InMemoryIndex;
use dedupv1d::persistence::InMemoryInfoStore;
use dedupv1d::scheduler::Scheduler;
use dedupv1d::scheduler::WorkerPool;
use dedupv1d::target_info::TargetInfo;
use dedupv1d::target_info::TargetRecord;
use dedupv1d::user_info::UserInfo;
use dedupv1d::user_info::UserRecord;
use dedupv1d::volume::VolumeCreateOptions;
use dedupv1d::volume_info::VolumeInfo;
use sync::Mutex;

/// Deduplicated iSCSI/SCSI block target daemon.
#[derive(FromArgs)]
struct DedupV1dArgs {
    /// path to the daemon's TOML configuration file
    #[argh(option)]
    config: PathBuf,

    /// increase log verbosity to debug level
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// decrease log verbosity to error level only
    #[argh(switch, short = 'q')]
    quiet: bool,

    /// this start creates fresh on-disk state rather than attaching to
    /// existing state
    #[argh(switch)]
    create: bool,

    /// this start is attaching to state that was not cleanly shut down
    #[argh(switch)]
    dirty: bool,
}

/// Resolves to the real `VolumeInfo` once constructed, breaking the
/// `FastCopyEngine <-> VolumeInfo` construction cycle: `FastCopyEngine`
/// needs a `VolumeLookup` at construction time, but `VolumeInfo` needs the
/// already-constructed `FastCopyEngine`.
struct DeferredVolumeLookup {
    volume_info: Mutex<Option<Arc<VolumeInfo>>>,
}

impl DeferredVolumeLookup {
    fn new() -> Arc<DeferredVolumeLookup> {
        Arc::new(DeferredVolumeLookup {
            volume_info: Mutex::new(None),
        })
    }

    fn resolve(&self, volume_info: Arc<VolumeInfo>) {
        *self.volume_info.lock() = Some(volume_info);
    }
}

impl VolumeLookup for DeferredVolumeLookup {
    fn dedup_volume(&self, volume_id: u32) -> Option<Arc<dyn DedupVolume>> {
        self.volume_info.lock().as_ref().and_then(|v| v.dedup_volume(volume_id))
    }
}

fn main() -> Result<()> {
    let args: DedupV1dArgs = argh::from_env();
    syslog::init(LogConfig {
        filter: syslog::level_from_verbosity(args.verbose as u8, args.quiet as u8),
    });

    let config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    let group_info = GroupInfo::new(Arc::new(InMemoryIndex::new()));
    let preconfigured_groups: Vec<String> = config.groups.iter().map(|g| g.name.clone()).collect();
    group_info.start(&preconfigured_groups)?;

    let user_info = UserInfo::new(Arc::new(InMemoryIndex::new()));
    let preconfigured_users: Vec<UserRecord> = config
        .users
        .iter()
        .map(|u| UserRecord {
            name: u.name.clone(),
            secret_hash: u.secret_hash.clone(),
            targets: u.targets.clone(),
            preconfigured: true,
        })
        .collect();
    user_info.start(preconfigured_users)?;

    let target_info = TargetInfo::new(Arc::new(InMemoryIndex::new()), user_info.clone());
    let mut preconfigured_targets = Vec::with_capacity(config.targets.len());
    for target in &config.targets {
        preconfigured_targets.push(TargetRecord {
            tid: target.tid,
            name: target.name.clone(),
            params: parse_params(&target.params)?,
            auth_username: None,
            auth_secret_hash: None,
            preconfigured: true,
        });
    }
    target_info.start(preconfigured_targets)?;

    let dedup_system: Arc<dyn DedupSystem> = Arc::new(NullDedupSystem);
    let error_store = Arc::new(InMemoryInfoStore::new());

    let detacher = VolumeDetacher::new(Arc::new(InMemoryIndex::new()), dedup_system.clone(), Arc::new(AlwaysIdle));
    detacher.start()?;
    detacher.run()?;

    let deferred_lookup = DeferredVolumeLookup::new();
    let fast_copy = FastCopyEngine::new(error_store.clone(), deferred_lookup.clone());
    fast_copy.start()?;
    fast_copy.run();

    let dedup_volume_factory = Arc::new(|_id: u32| Arc::new(NullDedupVolume) as Arc<dyn DedupVolume>);
    let kernel_bridge_factory = Arc::new(|_id: u32| Arc::new(NullKernelBridge) as Arc<dyn KernelScsiBridge>);
    let volume_info = VolumeInfo::new(
        Arc::new(InMemoryIndex::new()),
        dedup_system.clone(),
        dedup_volume_factory,
        kernel_bridge_factory,
        error_store.clone(),
        detacher.clone(),
        fast_copy.clone(),
    );
    deferred_lookup.resolve(volume_info.clone());
    target_info.set_volume_directory(volume_info.clone());

    let preconfigured_volumes: Vec<VolumeCreateOptions> = config
        .volumes
        .iter()
        .map(|v| VolumeCreateOptions {
            id: v.id,
            device_name: v.device_name.clone(),
            logical_size: v.logical_size,
            sector_size: v.sector_size,
            command_thread_count: v.command_thread_count,
            preconfigured: true,
        })
        .collect();
    volume_info.start(
        group_info,
        target_info,
        preconfigured_volumes,
        StartContext {
            create: args.create,
            dirty: args.dirty,
        },
    )?;
    volume_info.run_all()?;

    let pool = WorkerPool::new(config.scheduler_threads);
    let scheduler = Scheduler::new();
    scheduler.start(pool);
    scheduler.run();

    info!("dedupv1d started (persistence_dir={:?})", config.persistence_dir);

    let shutdown = Event::new();
    let signal_evt = shutdown.clone();
    ctrlc::set_handler(move || signal_evt.signal()).context("installing Ctrl-C handler")?;
    while !shutdown.wait_timeout(std::time::Duration::from_secs(1)) {}

    info!("dedupv1d shutting down");
    scheduler.stop();
    fast_copy.stop();
    detacher.stop();

    Ok(())
}
