//! The SDK instance: holds the current datafile, statuses, override tables,
//! the event emitter, and the refresh machinery, and exposes the public
//! evaluation entry points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::bucketing::DEFAULT_BUCKET_KEY_SEPARATOR;
use crate::datafile::{DatafileContent, StickyFeatures, VariableValue};
use crate::datafile_fetcher::{DatafileFetchHandler, DatafileFetcher, HttpOptions};
use crate::datafile_store::DatafileStore;
use crate::emitter::{ActivationEvent, Emitter, Event, EventName, ListenerId};
use crate::evaluation::{
    Evaluator, FlagEvaluation, Hooks, VariableEvaluation, VariationEvaluation,
};
use crate::refresher::{RefresherConfig, RefresherThread};
use crate::{Context, Error, Result};

/// An inline datafile: either already parsed or raw JSON.
pub enum DatafileSource {
    Content(DatafileContent),
    Json(String),
}

impl From<DatafileContent> for DatafileSource {
    fn from(value: DatafileContent) -> DatafileSource {
        DatafileSource::Content(value)
    }
}

impl From<String> for DatafileSource {
    fn from(value: String) -> DatafileSource {
        DatafileSource::Json(value)
    }
}

impl From<&str> for DatafileSource {
    fn from(value: &str) -> DatafileSource {
        DatafileSource::Json(value.to_owned())
    }
}

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Configuration for [`Instance`].
///
/// At least one of [`InstanceOptions::with_datafile`] or
/// [`InstanceOptions::with_datafile_url`] must be provided.
///
/// # Examples
/// ```no_run
/// # use std::time::Duration;
/// # use featurekit::InstanceOptions;
/// let options = InstanceOptions::new()
///     .with_datafile_url("https://cdn.example.com/datafile.json")
///     .with_refresh_interval(Duration::from_secs(60));
/// ```
#[derive(Default)]
pub struct InstanceOptions {
    datafile: Option<DatafileSource>,
    datafile_url: Option<String>,
    handle_datafile_fetch: Option<Box<DatafileFetchHandler>>,
    bucket_key_separator: Option<String>,
    hooks: Hooks,
    initial_features: Option<StickyFeatures>,
    sticky_features: Option<StickyFeatures>,
    refresh_interval: Option<Duration>,
    http_options: HttpOptions,
    on_ready: Option<EventCallback>,
    on_refresh: Option<EventCallback>,
    on_update: Option<EventCallback>,
    on_activation: Option<EventCallback>,
}

impl InstanceOptions {
    pub fn new() -> InstanceOptions {
        InstanceOptions::default()
    }

    /// Supply the datafile inline. The instance is ready immediately.
    pub fn with_datafile(mut self, datafile: impl Into<DatafileSource>) -> InstanceOptions {
        self.datafile = Some(datafile.into());
        self
    }

    /// Fetch the datafile from a URL. The instance becomes ready once the
    /// initial fetch succeeds.
    pub fn with_datafile_url(mut self, url: impl Into<String>) -> InstanceOptions {
        self.datafile_url = Some(url.into());
        self
    }

    /// Replace the built-in HTTP fetch with a custom transport.
    pub fn with_handle_datafile_fetch(
        mut self,
        handler: impl Fn(&str) -> Result<DatafileContent> + Send + Sync + 'static,
    ) -> InstanceOptions {
        self.handle_datafile_fetch = Some(Box::new(handler));
        self
    }

    /// Separator placed between bucket key segments. Defaults to `"."`.
    pub fn with_bucket_key_separator(mut self, separator: impl Into<String>) -> InstanceOptions {
        self.bucket_key_separator = Some(separator.into());
        self
    }

    pub fn with_configure_bucket_key(
        mut self,
        configure: impl Fn(&str, &Context, String) -> String + Send + Sync + 'static,
    ) -> InstanceOptions {
        self.hooks.configure_bucket_key = Some(Box::new(configure));
        self
    }

    pub fn with_configure_bucket_value(
        mut self,
        configure: impl Fn(&str, &Context, u32) -> u32 + Send + Sync + 'static,
    ) -> InstanceOptions {
        self.hooks.configure_bucket_value = Some(Box::new(configure));
        self
    }

    /// Transform the context once per evaluation before bucketing and
    /// traffic matching. The hook must be pure.
    pub fn with_intercept_context(
        mut self,
        intercept: impl Fn(&Context) -> Context + Send + Sync + 'static,
    ) -> InstanceOptions {
        self.hooks.intercept_context = Some(Box::new(intercept));
        self
    }

    pub fn with_initial_features(mut self, initial: StickyFeatures) -> InstanceOptions {
        self.initial_features = Some(initial);
        self
    }

    pub fn with_sticky_features(mut self, sticky: StickyFeatures) -> InstanceOptions {
        self.sticky_features = Some(sticky);
        self
    }

    /// Refresh the datafile periodically at this interval. Only takes effect
    /// for URL-constructed instances.
    pub fn with_refresh_interval(mut self, interval: Duration) -> InstanceOptions {
        self.refresh_interval = Some(interval);
        self
    }

    pub fn with_http_options(mut self, http_options: HttpOptions) -> InstanceOptions {
        self.http_options = http_options;
        self
    }

    pub fn on_ready(mut self, callback: impl Fn(&Event) + Send + Sync + 'static) -> InstanceOptions {
        self.on_ready = Some(Box::new(callback));
        self
    }

    pub fn on_refresh(
        mut self,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> InstanceOptions {
        self.on_refresh = Some(Box::new(callback));
        self
    }

    pub fn on_update(mut self, callback: impl Fn(&Event) + Send + Sync + 'static) -> InstanceOptions {
        self.on_update = Some(Box::new(callback));
        self
    }

    pub fn on_activation(
        mut self,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> InstanceOptions {
        self.on_activation = Some(Box::new(callback));
        self
    }
}

/// Create an SDK instance from the given options.
///
/// Equivalent to [`Instance::new`].
pub fn create_instance(options: InstanceOptions) -> Result<Instance> {
    Instance::new(options)
}

/// A feature-flag SDK instance.
///
/// Cloning is cheap and produces a handle to the same underlying state.
/// Evaluation entry points are synchronous and never block on I/O: each one
/// takes a snapshot of the current datafile and decides from it.
#[derive(Clone)]
pub struct Instance {
    core: Arc<InstanceCore>,
}

struct InstanceCore {
    store: DatafileStore,
    ready: AtomicBool,
    refresh_in_progress: AtomicBool,
    sticky: RwLock<Option<StickyFeatures>>,
    initial: Option<StickyFeatures>,
    emitter: Emitter,
    hooks: Hooks,
    bucket_key_separator: String,
    datafile_url: Option<String>,
    fetch_handler: Option<Box<DatafileFetchHandler>>,
    fetcher: Option<DatafileFetcher>,
    refresh_interval: Option<Duration>,
    refresher: Mutex<Option<RefresherThread>>,
}

impl Instance {
    /// Create an instance.
    ///
    /// With an inline datafile the instance is ready on return and `ready`
    /// has already fired. With only a URL, the initial fetch runs on a
    /// background thread; subscribe to `ready` (or poll
    /// [`Instance::is_ready`]) to learn when evaluation reflects the fetched
    /// datafile. Evaluating before readiness is safe and decides from the
    /// empty datafile.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingDatafileOptions`] when neither a datafile nor a URL
    ///   was provided.
    /// - [`Error::DatafileParse`] when the inline datafile JSON is invalid.
    pub fn new(options: InstanceOptions) -> Result<Instance> {
        if options.datafile.is_none() && options.datafile_url.is_none() {
            return Err(Error::MissingDatafileOptions);
        }

        let emitter = Emitter::new();
        if let Some(callback) = options.on_ready {
            emitter.add_listener(EventName::Ready, callback);
        }
        if let Some(callback) = options.on_refresh {
            emitter.add_listener(EventName::Refresh, callback);
        }
        if let Some(callback) = options.on_update {
            emitter.add_listener(EventName::Update, callback);
        }
        if let Some(callback) = options.on_activation {
            emitter.add_listener(EventName::Activation, callback);
        }

        let inline_datafile = match options.datafile {
            Some(DatafileSource::Content(datafile)) => Some(datafile),
            Some(DatafileSource::Json(json)) => Some(DatafileContent::from_json(&json)?),
            None => None,
        };
        let has_inline_datafile = inline_datafile.is_some();

        let fetcher = match (&options.datafile_url, &options.handle_datafile_fetch) {
            (Some(url), None) => match DatafileFetcher::new(url, &options.http_options) {
                Ok(fetcher) => Some(fetcher),
                Err(err) => {
                    log::error!(target: "featurekit", "invalid datafile URL, fetching disabled: {err}");
                    None
                }
            },
            _ => None,
        };

        let core = Arc::new(InstanceCore {
            store: DatafileStore::new(inline_datafile.unwrap_or_else(DatafileContent::empty)),
            ready: AtomicBool::new(false),
            refresh_in_progress: AtomicBool::new(false),
            sticky: RwLock::new(options.sticky_features),
            initial: options.initial_features,
            emitter,
            hooks: options.hooks,
            bucket_key_separator: options
                .bucket_key_separator
                .unwrap_or_else(|| DEFAULT_BUCKET_KEY_SEPARATOR.to_owned()),
            datafile_url: options.datafile_url,
            fetch_handler: options.handle_datafile_fetch,
            fetcher,
            refresh_interval: options.refresh_interval,
            refresher: Mutex::new(None),
        });

        if has_inline_datafile {
            core.ready.store(true, Ordering::SeqCst);
            log::info!(target: "featurekit", revision = core.store.get().revision.as_str(); "instance is ready");
            core.emitter.emit(&Event::Ready);
        } else {
            let weak = Arc::downgrade(&core);
            std::thread::Builder::new()
                .name("featurekit-init".to_owned())
                .spawn(move || {
                    let Some(core) = weak.upgrade() else {
                        return;
                    };
                    core.initial_fetch();
                })?;
        }

        Ok(Instance { core })
    }

    /// Whether the instance has a usable datafile.
    pub fn is_ready(&self) -> bool {
        self.core.ready.load(Ordering::SeqCst)
    }

    /// Revision of the current datafile.
    pub fn get_revision(&self) -> String {
        self.core.store.get().revision.clone()
    }

    /// Replace the current datafile.
    ///
    /// Malformed JSON is logged and the previous datafile is retained.
    pub fn set_datafile(&self, datafile: impl Into<DatafileSource>) {
        let datafile = match datafile.into() {
            DatafileSource::Content(datafile) => datafile,
            DatafileSource::Json(json) => match DatafileContent::from_json(&json) {
                Ok(datafile) => datafile,
                Err(err) => {
                    log::error!(target: "featurekit", "failed to parse datafile, keeping the previous one: {err}");
                    return;
                }
            },
        };
        self.core.store.set(Arc::new(datafile));
    }

    /// Replace (or clear, with `None`) the sticky override table.
    pub fn set_sticky_features(&self, sticky_features: Option<StickyFeatures>) {
        let mut sticky = self
            .core
            .sticky
            .write()
            .expect("thread holding sticky features lock should not panic");
        *sticky = sticky_features;
    }

    /// Fetch the datafile now and install it on success.
    ///
    /// No-op (with a warning) when a refresh is already in progress or no
    /// datafile URL is configured. Emits `refresh` after a successful
    /// install, plus `update` when the revision changed.
    pub fn refresh(&self) {
        self.core.refresh();
    }

    /// Start the periodic background refresh at the configured interval.
    /// Starting twice is a warn-and-no-op.
    pub fn start_refreshing(&self) {
        self.core.start_refreshing();
    }

    /// Cancel the periodic background refresh.
    pub fn stop_refreshing(&self) {
        self.core.stop_refreshing();
    }

    /// Full flag decision, with the reason.
    pub fn evaluate_flag(&self, feature_key: &str, context: &Context) -> FlagEvaluation {
        self.core
            .with_evaluator(|evaluator| evaluator.evaluate_flag(feature_key, context))
    }

    /// Full variation decision, with the reason.
    pub fn evaluate_variation(&self, feature_key: &str, context: &Context) -> VariationEvaluation {
        self.core
            .with_evaluator(|evaluator| evaluator.evaluate_variation(feature_key, context))
    }

    /// Full variable decision, with the reason.
    pub fn evaluate_variable(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> VariableEvaluation {
        self.core.with_evaluator(|evaluator| {
            evaluator.evaluate_variable(feature_key, variable_key, context)
        })
    }

    /// Whether the feature is enabled for the context.
    pub fn is_enabled(&self, feature_key: &str, context: &Context) -> bool {
        self.evaluate_flag(feature_key, context).value
    }

    /// The variation of the feature for the context, if any.
    pub fn get_variation(&self, feature_key: &str, context: &Context) -> Option<String> {
        self.evaluate_variation(feature_key, context).value
    }

    /// The value of a feature's variable for the context, if any.
    pub fn get_variable(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> Option<VariableValue> {
        self.evaluate_variable(feature_key, variable_key, context).value
    }

    pub fn get_variable_boolean(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> Option<bool> {
        match self.get_variable(feature_key, variable_key, context)? {
            VariableValue::Boolean(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_variable_string(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> Option<String> {
        match self.get_variable(feature_key, variable_key, context)? {
            VariableValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_variable_integer(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> Option<i64> {
        match self.get_variable(feature_key, variable_key, context)? {
            VariableValue::Integer(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_variable_double(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> Option<f64> {
        match self.get_variable(feature_key, variable_key, context)? {
            VariableValue::Double(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_variable_array(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> Option<Vec<String>> {
        match self.get_variable(feature_key, variable_key, context)? {
            VariableValue::Array(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_variable_object(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> Option<serde_json::Map<String, serde_json::Value>> {
        match self.get_variable(feature_key, variable_key, context)? {
            VariableValue::Object(value) => Some(value),
            _ => None,
        }
    }

    /// JSON view of the variable: parses a JSON-string payload, passes an
    /// object payload through.
    pub fn get_variable_json(
        &self,
        feature_key: &str,
        variable_key: &str,
        context: &Context,
    ) -> Option<serde_json::Value> {
        match self.get_variable(feature_key, variable_key, context)? {
            VariableValue::String(value) => serde_json::from_str(&value).ok(),
            VariableValue::Object(value) => Some(serde_json::Value::Object(value)),
            _ => None,
        }
    }

    /// Evaluate the variation and, when one resolves, emit an `activation`
    /// event carrying the context filtered down to capture-flagged
    /// attributes. Returns the variation value.
    pub fn activate(&self, feature_key: &str, context: &Context) -> Option<String> {
        let evaluation = self.evaluate_variation(feature_key, context);
        let variation_value = evaluation.value.clone()?;

        let final_context = match &self.core.hooks.intercept_context {
            Some(intercept) => intercept(context),
            None => context.clone(),
        };

        let datafile = self.core.store.get();
        let captured_context: Context = datafile
            .attributes
            .iter()
            .filter(|attribute| attribute.capture)
            .filter_map(|attribute| {
                final_context
                    .get(&attribute.key)
                    .map(|value| (attribute.key.clone(), value.clone()))
            })
            .collect();

        self.core.emitter.emit(&Event::Activation(ActivationEvent {
            feature_key: feature_key.to_owned(),
            variation_value: variation_value.clone(),
            context: final_context,
            captured_context,
            evaluation,
        }));

        Some(variation_value)
    }

    /// Register a listener. See [`Emitter::add_listener`].
    pub fn add_listener(
        &self,
        event: EventName,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.core.emitter.add_listener(event, listener)
    }

    /// Alias of [`Instance::add_listener`].
    pub fn on(
        &self,
        event: EventName,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.core.emitter.on(event, listener)
    }

    /// Remove a listener. See [`Emitter::remove_listener`].
    pub fn remove_listener(&self, event: EventName, id: ListenerId) -> bool {
        self.core.emitter.remove_listener(event, id)
    }

    /// Alias of [`Instance::remove_listener`].
    pub fn off(&self, event: EventName, id: ListenerId) -> bool {
        self.core.emitter.off(event, id)
    }

    /// Remove all listeners for one event, or for every event.
    pub fn remove_all_listeners(&self, event: Option<EventName>) {
        self.core.emitter.remove_all_listeners(event)
    }
}

impl InstanceCore {
    fn with_evaluator<R>(&self, f: impl FnOnce(&Evaluator) -> R) -> R {
        // One datafile snapshot per evaluation: a concurrent refresh cannot
        // change a decision halfway through.
        let datafile = self.store.get();
        let sticky = self
            .sticky
            .read()
            .expect("thread holding sticky features lock should not panic");

        let evaluator = Evaluator::new(&datafile)
            .with_sticky(sticky.as_ref())
            .with_initial(self.initial.as_ref())
            .with_ready(self.ready.load(Ordering::SeqCst))
            .with_hooks(&self.hooks)
            .with_bucket_key_separator(&self.bucket_key_separator);

        f(&evaluator)
    }

    fn initial_fetch(self: &Arc<Self>) {
        let Some(url) = self.datafile_url.as_deref() else {
            return;
        };

        // Hold the refresh flag through the initial fetch so that a manual
        // `refresh()` racing it is skipped; `ready` always fires before any
        // `refresh` or `update`.
        self.refresh_in_progress.store(true, Ordering::SeqCst);

        match self.fetch_datafile(url) {
            Some(Ok(datafile)) => {
                let revision = datafile.revision.clone();
                self.store.set(Arc::new(datafile));
                self.ready.store(true, Ordering::SeqCst);
                // Release the flag before emitting so that a `ready`
                // listener may refresh immediately.
                self.refresh_in_progress.store(false, Ordering::SeqCst);
                log::info!(target: "featurekit", revision = revision.as_str(); "instance is ready");
                self.emitter.emit(&Event::Ready);

                if self.refresh_interval.is_some() {
                    self.start_refreshing();
                }
            }
            Some(Err(err)) => {
                // Stay not-ready; a manual or scheduled refresh retries.
                log::error!(target: "featurekit", "failed to fetch initial datafile: {err}");
            }
            None => {}
        }

        self.refresh_in_progress.store(false, Ordering::SeqCst);
    }

    fn refresh(&self) {
        if self.refresh_in_progress.load(Ordering::SeqCst) {
            log::warn!(target: "featurekit", "refresh already in progress, skipping");
            return;
        }

        let Some(url) = self.datafile_url.as_deref() else {
            log::warn!(target: "featurekit", "cannot refresh without a datafile URL");
            return;
        };

        if self.refresh_in_progress.swap(true, Ordering::SeqCst) {
            // Lost the race to another caller.
            log::warn!(target: "featurekit", "refresh already in progress, skipping");
            return;
        }

        match self.fetch_datafile(url) {
            Some(Ok(datafile)) => {
                let previous_revision = self.store.get().revision.clone();
                let revision = datafile.revision.clone();
                self.store.set(Arc::new(datafile));
                log::info!(target: "featurekit", revision = revision.as_str(); "refreshed datafile");

                self.emitter.emit(&Event::Refresh);
                if revision != previous_revision {
                    self.emitter.emit(&Event::Update);
                }
            }
            Some(Err(err)) => {
                log::error!(target: "featurekit", "failed to refresh datafile: {err}");
            }
            None => {
                log::warn!(target: "featurekit", "datafile URL is invalid, skipping refresh");
            }
        }

        self.refresh_in_progress.store(false, Ordering::SeqCst);
    }

    /// Returns `None` when no transport is available (the URL failed
    /// validation at construction).
    fn fetch_datafile(&self, url: &str) -> Option<crate::Result<DatafileContent>> {
        if let Some(handler) = &self.fetch_handler {
            return Some(handler(url));
        }

        let fetcher = self.fetcher.as_ref()?;
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::from)
            .and_then(|runtime| runtime.block_on(fetcher.fetch()));
        Some(result)
    }

    fn start_refreshing(self: &Arc<Self>) {
        if self.datafile_url.is_none() {
            log::warn!(target: "featurekit", "cannot start refreshing without a datafile URL");
            return;
        }
        let Some(interval) = self.refresh_interval else {
            log::warn!(target: "featurekit", "cannot start refreshing without a refresh interval");
            return;
        };

        let mut slot = self
            .refresher
            .lock()
            .expect("thread holding refresher lock should not panic");
        if slot.is_some() {
            log::warn!(target: "featurekit", "refreshing has already started, skipping");
            return;
        }

        let weak = Arc::downgrade(self);
        match RefresherThread::start(RefresherConfig::new(interval), move || {
            if let Some(core) = weak.upgrade() {
                core.refresh();
            }
        }) {
            Ok(thread) => *slot = Some(thread),
            Err(err) => {
                log::error!(target: "featurekit", "failed to start refresher thread: {err}");
            }
        }
    }

    fn stop_refreshing(&self) {
        let thread = self
            .refresher
            .lock()
            .expect("thread holding refresher lock should not panic")
            .take();

        match thread {
            Some(thread) => thread.stop(),
            None => log::debug!(target: "featurekit", "refreshing is not started"),
        }
    }
}

impl Drop for InstanceCore {
    fn drop(&mut self) {
        if let Ok(slot) = self.refresher.get_mut() {
            if let Some(thread) = slot.take() {
                thread.stop();
            }
        }
    }
}
