use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use crate::capabilities::CapabilityRegistry;
use crate::page::SharedTree;
use crate::resolver::{CompanionResolver, HttpProbe, Probe};
use crate::settings::{load_settings, Settings, SettingsStore};
use crate::shims::{GuardedModalFactory, VideoSafeNormalizer};
use crate::upgrade::UpgradeEngine;
use crate::upload::{widen_upload_accept, SharedUploadState, UploadInterceptor, UploadState};
use crate::uploader::{CompanionSink, CompanionUploader};
use crate::watcher::{MutationBatch, MutationWatcher};

/// Fixed interval for bounded host polling.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Readiness wait budget: 20 ticks of [`POLL_INTERVAL`].
pub const READY_MAX_ATTEMPTS: u32 = 20;
/// Modal construct wait budget: the host defines it asynchronously.
pub const SHIM_MAX_ATTEMPTS: u32 = 40;

/// The host-side signal plumbing handed to [`Runtime::attach`].
pub struct HostSignals {
    /// One-shot readiness notification from the host's event bus.
    pub ready: oneshot::Receiver<()>,
    /// Subtree-change notifications from the host's render layer.
    pub mutations: mpsc::UnboundedReceiver<MutationBatch>,
    /// Message-rendered / chat-changed events; each triggers a full re-scan.
    pub rescans: mpsc::UnboundedReceiver<()>,
}

/// Ties the components together against one page tree and one capability
/// registry, and owns the degraded-startup policy: a host that never raises
/// its signals leaves the feature off without erroring.
pub struct Runtime {
    tree: SharedTree,
    registry: Rc<RefCell<CapabilityRegistry>>,
    engine: UpgradeEngine,
    interceptor: UploadInterceptor,
    state: SharedUploadState,
    normalizer_shim: Rc<VideoSafeNormalizer>,
    verbose: bool,
}

impl Runtime {
    /// Production wiring: HTTP probe and uploader against the page origin.
    pub fn new(
        tree: SharedTree,
        registry: Rc<RefCell<CapabilityRegistry>>,
        settings: Settings,
        http: Client,
        verbose: bool,
    ) -> Rc<Self> {
        let probe: Rc<dyn Probe> = Rc::new(HttpProbe::new(http.clone()));
        let base = tree.borrow().base_url().clone();
        let sink: Rc<dyn CompanionSink> = Rc::new(
            CompanionUploader::new(http, base, Some(registry.clone())).with_verbose(verbose),
        );
        Self::with_probe_and_sink(tree, registry, settings, probe, sink, verbose)
    }

    /// Production wiring with settings read from the host's persistent
    /// storage (defaults merged in for missing keys).
    pub fn from_store(
        tree: SharedTree,
        registry: Rc<RefCell<CapabilityRegistry>>,
        store: &dyn SettingsStore,
        http: Client,
        verbose: bool,
    ) -> Rc<Self> {
        let settings = load_settings(store);
        Self::new(tree, registry, settings, http, verbose)
    }

    /// Core constructor with the transport seams injected.
    pub fn with_probe_and_sink(
        tree: SharedTree,
        registry: Rc<RefCell<CapabilityRegistry>>,
        settings: Settings,
        probe: Rc<dyn Probe>,
        sink: Rc<dyn CompanionSink>,
        verbose: bool,
    ) -> Rc<Self> {
        let resolver = Rc::new(
            CompanionResolver::new(probe, settings.order.clone(), settings.use_head_probe)
                .with_verbose(verbose),
        );
        let engine = if verbose {
            UpgradeEngine::with_verbose(tree.clone(), resolver, settings.enabled)
        } else {
            UpgradeEngine::new(tree.clone(), resolver, settings.enabled)
        };
        let state: SharedUploadState = Rc::new(RefCell::new(UploadState::default()));
        let interceptor = UploadInterceptor::new(
            tree.clone(),
            registry.clone(),
            state.clone(),
            sink,
            verbose,
        );
        let normalizer_shim = Rc::new(VideoSafeNormalizer::new(tree.clone()));
        Rc::new(Self {
            tree,
            registry,
            engine,
            interceptor,
            state,
            normalizer_shim,
            verbose,
        })
    }

    pub fn engine(&self) -> &UpgradeEngine {
        &self.engine
    }

    /// The host adapter routes its capture-phase change/input events here.
    pub fn interceptor(&self) -> &UploadInterceptor {
        &self.interceptor
    }

    pub fn registry(&self) -> Rc<RefCell<CapabilityRegistry>> {
        self.registry.clone()
    }

    /// Hooks that must hold even if the user acts before the host is ready:
    /// widened accept filters and the normalization shim.
    pub fn bootstrap_early(&self) {
        let body = self.tree.borrow().body();
        widen_upload_accept(&mut self.tree.borrow_mut(), body);
        self.normalizer_shim
            .set_extractor(self.registry.borrow().frame_extractor());
        self.registry
            .borrow_mut()
            .install_normalizer_shim(self.normalizer_shim.clone());
    }

    /// Wire up against the host. Waits for readiness within the polling
    /// budget; on timeout the feature silently stays off (the interceptor
    /// and shims from [`Self::bootstrap_early`] keep working).
    pub async fn attach(self: Rc<Self>, signals: HostSignals) {
        self.bootstrap_early();

        let this = self.clone();
        tokio::task::spawn_local(async move { this.install_modal_guard().await });

        let HostSignals {
            ready,
            mutations,
            rescans,
        } = signals;

        match timeout(POLL_INTERVAL * READY_MAX_ATTEMPTS, ready).await {
            Ok(Ok(())) => {}
            _ => {
                eprintln!("[WARN] host ready signal never arrived; avatar upgrades stay off");
                return;
            }
        }
        self.on_ready();

        let watcher = MutationWatcher::new(self.tree.clone(), self.engine.clone());
        tokio::task::spawn_local(watcher.run(mutations));

        let this = self.clone();
        tokio::task::spawn_local(async move {
            let mut rescans = rescans;
            while rescans.recv().await.is_some() {
                this.rescan();
            }
        });
    }

    fn on_ready(&self) {
        let body = self.tree.borrow().body();
        widen_upload_accept(&mut self.tree.borrow_mut(), body);
        // Capabilities registered between bootstrap and readiness are picked
        // up here.
        self.normalizer_shim
            .set_extractor(self.registry.borrow().frame_extractor());
        if self.verbose {
            eprintln!("[DEBUG] host ready; starting initial avatar scan");
        }
        self.engine.upgrade_all(body);
    }

    /// Full-document re-scan. Public so other extensions can trigger a pass.
    pub fn rescan(&self) {
        let body = self.tree.borrow().body();
        self.engine.upgrade_all(body);
    }

    /// The host may define its modal construct well after startup; keep
    /// checking within the budget, then degrade with a diagnostic.
    async fn install_modal_guard(self: Rc<Self>) {
        let guard = Rc::new(GuardedModalFactory::new(
            self.tree.clone(),
            self.state.clone(),
        ));
        for _ in 0..SHIM_MAX_ATTEMPTS {
            {
                let mut registry = self.registry.borrow_mut();
                if registry.has_modal_factory() {
                    registry.install_modal_guard(guard.clone());
                    if self.verbose {
                        eprintln!("[DEBUG] modal guard installed");
                    }
                    return;
                }
            }
            sleep(POLL_INTERVAL).await;
        }
        eprintln!("[WARN] host modal construct never appeared; crop bypass disabled");
    }
}
