//! Board facade
//!
//! [`Board`] is the single owner of everything a connection needs: the
//! transport, the descriptor arena, the dispatcher, the provisioning engines
//! and the route registry. It is deliberately single-threaded and
//! cooperative: all mutation flows through [`Board::on_notification`] and
//! [`Board::process_timeouts`], with time injected through the [`Clock`]
//! trait so tests control every deadline.
//!
//! Construction requests (routes, observers, timers) queue FIFO and run
//! strictly one at a time; each walks the provisioning phases processors →
//! loggers → events before its promise resolves.

use crate::codec::{self, Layout};
use crate::config::LinkConfig;
use crate::descriptor::{DataDescriptor, DescId, DescriptorArena, Enable, SignalClass};
use crate::dispatch::{Dispatcher, HandlerKey, Inbound};
use crate::error::{LinkError, Result};
use crate::pending::{pending, Completion, Pending};
use crate::protocol::{self, modules, NO_INSTANCE, READ_INFO};
use crate::provision::engine::{CompletedItem, EngineEvent, EngineStep, ProvisionEngine};
use crate::provision::event::{self, CommandRecorder};
use crate::provision::logger;
use crate::provision::processor::{self, ActiveProcessor, ProcessorConfig};
use crate::route::builder::RouteComponent;
use crate::route::registry::RouteRegistry;
use crate::route::route::{
    Consumer, ConsumerKind, Observer, ObserverId, Route, RouteId, Subscriber, TimerId, TimerTask,
};
use crate::route::state::BuildState;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source for provisioning deadlines
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock advanced by hand, for driving timeouts deterministically in tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Instant::now()),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

/// Identity and revision of one firmware module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub module: u8,
    pub implementation: u8,
    pub revision: u8,
    /// Module-specific trailing bytes, preserved verbatim
    pub extra: Vec<u8>,
}

/// Persistable slice of a connection's state
#[derive(Debug, Serialize, Deserialize)]
pub struct BoardSnapshot {
    arena: DescriptorArena,
    modules: HashMap<u8, ModuleInfo>,
}

impl BoardSnapshot {
    /// Serialize for on-disk persistence
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LinkError::Config(format!("failed to serialize snapshot: {e}")))
    }

    /// Parse a snapshot previously written by [`Self::to_json`]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| LinkError::Config(format!("failed to parse snapshot: {e}")))
    }
}

type RouteBuilderFn = Box<dyn FnOnce(&mut RouteComponent) -> Result<()> + Send>;
type RecorderFn = Box<dyn FnOnce(&mut CommandRecorder) -> Result<()> + Send>;

/// One queued construction request
enum Request {
    Route {
        source: DescId,
        build: RouteBuilderFn,
        done: Completion<RouteId>,
    },
    Observer {
        trigger: DescId,
        record: RecorderFn,
        done: Completion<ObserverId>,
    },
    Timer {
        period_ms: u32,
        repetitions: u16,
        delay_first: bool,
        done: Completion<TimerId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Processors,
    Loggers,
    Events,
}

struct RouteBuild {
    done: Completion<RouteId>,
    state: BuildState,
    phase: Phase,
    /// Firmware processor ids by staged index
    processor_ids: Vec<u8>,
    /// (consumer position, log ids) per logged consumer
    logger_ids: Vec<(usize, Vec<u8>)>,
    event_ids: Vec<u8>,
}

enum Construction {
    Route(RouteBuild),
    Observer {
        done: Completion<ObserverId>,
    },
    Timer {
        done: Completion<TimerId>,
        period_ms: u32,
        repetitions: u16,
    },
}

/// Host-side driver for one connected board
pub struct Board {
    transport: Box<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: LinkConfig,
    arena: DescriptorArena,
    dispatcher: Dispatcher,
    registry: RouteRegistry,

    processor_engine: ProvisionEngine,
    logger_engine: ProvisionEngine,
    event_engine: ProvisionEngine,
    timer_engine: ProvisionEngine,

    queue: VecDeque<Request>,
    active: Option<Construction>,

    module_info: HashMap<u8, ModuleInfo>,
    pending_module_reads: HashMap<u8, Vec<Completion<ModuleInfo>>>,
    active_processors: HashMap<u8, ActiveProcessor>,

    /// Stream delivery targets keyed the way the dispatcher matches frames
    streams: HashMap<HandlerKey, Vec<(RouteId, usize)>>,
    /// Log id to the consumer reassembling its chunks
    log_index: HashMap<u8, (RouteId, usize)>,
    log_download_enabled: bool,
    connected: bool,
}

impl Board {
    pub fn new(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Box<dyn Transport>,
        config: LinkConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            clock,
            config,
            arena: DescriptorArena::new(),
            dispatcher: Dispatcher::new(),
            registry: RouteRegistry::new(),
            processor_engine: ProvisionEngine::new(
                modules::DATA_PROCESSOR,
                protocol::data_processor::ADD,
                protocol::data_processor::REMOVE,
                "data processor",
            ),
            logger_engine: ProvisionEngine::new(
                modules::LOGGING,
                protocol::logging::TRIGGER,
                protocol::logging::REMOVE,
                "log trigger",
            ),
            event_engine: ProvisionEngine::new(
                modules::EVENT,
                protocol::event::ENTRY,
                protocol::event::REMOVE,
                "event entry",
            ),
            timer_engine: ProvisionEngine::new(
                modules::TIMER,
                protocol::timer::ENTRY,
                protocol::timer::REMOVE,
                "timer",
            ),
            queue: VecDeque::new(),
            active: None,
            module_info: HashMap::new(),
            pending_module_reads: HashMap::new(),
            active_processors: HashMap::new(),
            streams: HashMap::new(),
            log_index: HashMap::new(),
            log_download_enabled: false,
            connected: true,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Register a root sensor signal in the descriptor arena
    pub fn register_sensor(
        &mut self,
        module: u8,
        register: u8,
        layout: Layout,
        scale: f32,
        class: SignalClass,
        enable: Option<Enable>,
    ) -> DescId {
        self.arena.sensor(module, register, layout, scale, class, enable)
    }

    pub fn descriptor(&self, id: DescId) -> &DataDescriptor {
        self.arena.get(id)
    }

    // ----- discovery -----------------------------------------------------

    /// Read a module's implementation/revision info. Answers from the cache
    /// when the module was already discovered.
    pub fn discover_module(&mut self, module: u8) -> Pending<ModuleInfo> {
        let (mut done, result) = pending();
        if let Some(info) = self.module_info.get(&module) {
            done.resolve(Ok(info.clone()));
            return result;
        }
        if let Err(e) = self.send(&[module, READ_INFO]) {
            done.resolve(Err(e));
            return result;
        }
        self.dispatcher.expect_module_info(module);
        self.pending_module_reads.entry(module).or_default().push(done);
        result
    }

    /// Issue info reads for the modules the driver itself depends on.
    /// Revision gates (comparator format, fuser, accounter) read as zero
    /// until the answers arrive.
    pub fn discover_core_modules(&mut self) {
        for module in [
            modules::DATA_PROCESSOR,
            modules::EVENT,
            modules::LOGGING,
            modules::TIMER,
        ] {
            if !self.module_info.contains_key(&module) {
                drop(self.discover_module(module));
            }
        }
    }

    pub fn module_info(&self, module: u8) -> Option<&ModuleInfo> {
        self.module_info.get(&module)
    }

    fn module_revision(&self, module: u8) -> u8 {
        self.module_info.get(&module).map(|i| i.revision).unwrap_or(0)
    }

    // ----- construction requests ----------------------------------------

    /// Build a route from `source`. The builder callback stages the whole
    /// pipeline synchronously; provisioning then runs through the FIFO, one
    /// construction in flight board-wide. Validation failures resolve the
    /// promise without any firmware traffic.
    pub fn add_route<F>(&mut self, source: DescId, build: F) -> Pending<RouteId>
    where
        F: FnOnce(&mut RouteComponent) -> Result<()> + Send + 'static,
    {
        let (done, result) = pending();
        self.queue.push_back(Request::Route {
            source,
            build: Box::new(build),
            done,
        });
        self.start_next();
        result
    }

    /// Provision a standalone always-silent reaction on `trigger`
    pub fn add_observer<F>(&mut self, trigger: DescId, record: F) -> Pending<ObserverId>
    where
        F: FnOnce(&mut CommandRecorder) -> Result<()> + Send + 'static,
    {
        let (done, result) = pending();
        self.queue.push_back(Request::Observer {
            trigger,
            record: Box::new(record),
            done,
        });
        self.start_next();
        result
    }

    /// Provision an on-board timer firing every `period_ms`, `repetitions`
    /// times (0xFFFF = forever); `delay_first` postpones the first fire by
    /// one period.
    pub fn schedule_task(
        &mut self,
        period_ms: u32,
        repetitions: u16,
        delay_first: bool,
    ) -> Pending<TimerId> {
        let (done, result) = pending();
        self.queue.push_back(Request::Timer {
            period_ms,
            repetitions,
            delay_first,
            done,
        });
        self.start_next();
        result
    }

    fn start_next(&mut self) {
        while self.active.is_none() {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            self.start_request(request);
        }
    }

    fn start_request(&mut self, request: Request) {
        if !self.connected {
            match request {
                Request::Route { mut done, .. } => done.resolve(Err(LinkError::Disconnected)),
                Request::Observer { mut done, .. } => done.resolve(Err(LinkError::Disconnected)),
                Request::Timer { mut done, .. } => done.resolve(Err(LinkError::Disconnected)),
            }
            return;
        }
        match request {
            Request::Route { source, build, mut done } => {
                let mut state = BuildState::default();
                let dp_rev = self.module_revision(modules::DATA_PROCESSOR);
                let log_rev = self.module_revision(modules::LOGGING);
                let built = {
                    let mut component = RouteComponent::new(
                        &mut self.arena,
                        &mut state,
                        self.registry.names(),
                        &self.config,
                        source,
                        dp_rev,
                        log_rev,
                    );
                    build(&mut component)
                };
                if let Err(e) = built {
                    done.resolve(Err(e));
                    return;
                }
                if !state.branches.is_empty() {
                    done.resolve(Err(LinkError::InvalidRoute(
                        "route left a split() or multicast() unclosed".to_string(),
                    )));
                    return;
                }
                if state.consumers.is_empty()
                    && state.reactions.is_empty()
                    && state.processors.is_empty()
                    && state.names.is_empty()
                {
                    done.resolve(Err(LinkError::InvalidRoute(
                        "route stages nothing; add stream(), log(), react() or a processor"
                            .to_string(),
                    )));
                    return;
                }

                let items: Vec<_> = state
                    .processors
                    .iter()
                    .enumerate()
                    .map(|(tag, staged)| {
                        processor::create_item(
                            &self.arena,
                            staged.source,
                            &staged.config,
                            dp_rev,
                            tag,
                            staged.patches.clone(),
                        )
                    })
                    .collect();
                let count = state.processors.len();
                self.active = Some(Construction::Route(RouteBuild {
                    done,
                    state,
                    phase: Phase::Processors,
                    processor_ids: vec![0; count],
                    logger_ids: Vec::new(),
                    event_ids: Vec::new(),
                }));
                let now = self.clock.now();
                let timeout = self.config.ack_timeout();
                let step = self.processor_engine.start(items, now, timeout);
                self.drive(modules::DATA_PROCESSOR, step);
            }
            Request::Observer { trigger, record, mut done } => {
                let mut recorder =
                    CommandRecorder::new(self.config.max_event_commands, self.config.max_frame_len);
                if let Err(e) = record(&mut recorder) {
                    done.resolve(Err(e));
                    return;
                }
                if recorder.is_empty() {
                    done.resolve(Err(LinkError::InvalidRoute(
                        "observer recorded no commands".to_string(),
                    )));
                    return;
                }
                let items = event::create_items(&self.arena, trigger, &recorder.into_frames(), 0);
                self.active = Some(Construction::Observer { done });
                let now = self.clock.now();
                let timeout = self.config.ack_timeout();
                let step = self.event_engine.start(items, now, timeout);
                self.drive(modules::EVENT, step);
            }
            Request::Timer { period_ms, repetitions, delay_first, done } => {
                let mut payload = Vec::with_capacity(7);
                payload.extend(period_ms.to_le_bytes());
                payload.extend(repetitions.to_le_bytes());
                payload.push(delay_first as u8);
                let item = crate::provision::engine::ProvisionItem {
                    frames: vec![protocol::command(
                        modules::TIMER,
                        protocol::timer::ENTRY,
                        &payload,
                    )],
                    ids_required: 1,
                    tag: 0,
                    patches: Vec::new(),
                };
                self.active = Some(Construction::Timer {
                    done,
                    period_ms,
                    repetitions,
                });
                let now = self.clock.now();
                let timeout = self.config.ack_timeout();
                let step = self.timer_engine.start(vec![item], now, timeout);
                self.drive(modules::TIMER, step);
            }
        }
    }

    // ----- engine plumbing ----------------------------------------------

    fn engine_mut(&mut self, module: u8) -> Option<&mut ProvisionEngine> {
        match module {
            modules::DATA_PROCESSOR => Some(&mut self.processor_engine),
            modules::LOGGING => Some(&mut self.logger_engine),
            modules::EVENT => Some(&mut self.event_engine),
            modules::TIMER => Some(&mut self.timer_engine),
            _ => None,
        }
    }

    fn drive(&mut self, module: u8, step: EngineStep) {
        match step {
            EngineStep::Continue { send } => {
                for frame in send {
                    if let Err(e) = self.send(&frame) {
                        tracing::warn!(error = %e, "failed to send provisioning frame");
                    }
                }
                let (module, register, idle) = {
                    let engine = self.engine_mut(module).expect("driven engine exists");
                    (engine.module(), engine.create_register(), engine.is_idle())
                };
                if !idle {
                    self.dispatcher.arm_one_shot(module, register);
                }
            }
            EngineStep::Done { completed } => {
                self.on_batch_done(module, completed);
            }
            EngineStep::Failed { rollback, error } => {
                for frame in rollback {
                    if let Err(e) = self.send(&frame) {
                        tracing::warn!(error = %e, "failed to send rollback frame");
                    }
                }
                let (module, register) = {
                    let engine = self.engine_mut(module).expect("driven engine exists");
                    (engine.module(), engine.create_register())
                };
                self.dispatcher.disarm_one_shot(module, register);
                self.fail_active(error);
            }
        }
    }

    fn on_batch_done(&mut self, _module: u8, completed: Vec<CompletedItem>) {
        let Some(construction) = self.active.take() else {
            return;
        };
        match construction {
            Construction::Route(mut rb) => match rb.phase {
                Phase::Processors => {
                    for item in &completed {
                        let id = item.ids[0];
                        let staged = &rb.state.processors[item.tag];
                        rb.processor_ids[item.tag] = id;
                        if let Err(e) = self.arena.promote_instance(staged.produced, id) {
                            tracing::warn!(error = %e, id, "processor instance promotion failed");
                        }
                        self.active_processors.insert(
                            id,
                            ActiveProcessor {
                                id,
                                produced: staged.produced,
                                config: staged.config.clone(),
                            },
                        );
                    }

                    let chunk = self.config.log_chunk_len;
                    let items: Vec<_> = rb
                        .state
                        .consumers
                        .iter()
                        .enumerate()
                        .filter(|(_, c)| c.kind == ConsumerKind::Log)
                        .map(|(pos, c)| logger::create_item(&self.arena, c.desc, chunk, pos))
                        .collect();
                    rb.phase = Phase::Loggers;
                    self.active = Some(Construction::Route(rb));
                    let now = self.clock.now();
                    let timeout = self.config.ack_timeout();
                    let step = self.logger_engine.start(items, now, timeout);
                    self.drive(modules::LOGGING, step);
                }
                Phase::Loggers => {
                    for item in completed {
                        rb.logger_ids.push((item.tag, item.ids));
                    }

                    let dp_rev = self.module_revision(modules::DATA_PROCESSOR);
                    let mut items = Vec::new();
                    let mut tag = 0;
                    for reaction in &rb.state.reactions {
                        items.extend(event::create_items(
                            &self.arena,
                            reaction.trigger,
                            &reaction.commands,
                            tag,
                        ));
                        tag += reaction.commands.len();
                    }
                    for fb in &rb.state.feedback {
                        let trigger = rb
                            .state
                            .lookup_name(&fb.name)
                            .or_else(|| self.registry.lookup_name(&fb.name));
                        let Some(trigger) = trigger else {
                            let error = LinkError::InvalidRoute(format!(
                                "feedback name \"{}\" disappeared before provisioning",
                                fb.name
                            ));
                            self.active = Some(Construction::Route(rb));
                            self.fail_active(error);
                            return;
                        };
                        let frame = protocol::instance_command(
                            modules::DATA_PROCESSOR,
                            protocol::data_processor::PARAMETER,
                            rb.processor_ids[fb.dest_processor],
                            &fb.config.encode(dp_rev),
                        );
                        items.extend(event::create_items(&self.arena, trigger, &[frame], tag));
                        tag += 1;
                    }
                    rb.phase = Phase::Events;
                    self.active = Some(Construction::Route(rb));
                    let now = self.clock.now();
                    let timeout = self.config.ack_timeout();
                    let step = self.event_engine.start(items, now, timeout);
                    self.drive(modules::EVENT, step);
                }
                Phase::Events => {
                    for item in completed {
                        rb.event_ids.extend(item.ids);
                    }
                    self.finish_route(rb);
                }
            },
            Construction::Observer { mut done } => {
                let events: Vec<u8> = completed.into_iter().flat_map(|c| c.ids).collect();
                let id = self.registry.next_observer_id();
                self.registry.insert_observer(Observer::new(id, events));
                done.resolve(Ok(id));
                self.start_next();
            }
            Construction::Timer {
                mut done,
                period_ms,
                repetitions,
            } => {
                let firmware_id = completed
                    .first()
                    .and_then(|c| c.ids.first())
                    .copied()
                    .unwrap_or(NO_INSTANCE);
                // The timer's fire signal carries no payload
                let desc = self.arena.sensor(
                    modules::TIMER,
                    protocol::timer::ENTRY,
                    Layout {
                        sizes: Vec::new(),
                        replicas: 1,
                        offset: 0,
                        signed: false,
                    },
                    1.0,
                    SignalClass::Sensor,
                    None,
                );
                if let Err(e) = self.arena.promote_instance(desc, firmware_id) {
                    tracing::warn!(error = %e, "timer instance promotion failed");
                }
                let id = self.registry.next_timer_id();
                self.registry.insert_timer(TimerTask::new(
                    id,
                    firmware_id,
                    desc,
                    period_ms,
                    repetitions,
                ));
                done.resolve(Ok(id));
                self.start_next();
            }
        }
    }

    fn finish_route(&mut self, mut rb: RouteBuild) {
        let mut registered = Vec::new();
        for (name, desc) in &rb.state.names {
            if let Err(e) = self.registry.register_name(name, *desc) {
                self.registry.release_names(&registered);
                self.rollback_route_build(&rb);
                rb.done.resolve(Err(e));
                self.start_next();
                return;
            }
            registered.push(name.clone());
        }

        let route_id = self.registry.next_route_id();
        let mut consumers: Vec<Consumer> = rb
            .state
            .consumers
            .iter()
            .map(|c| Consumer::new(c.desc, c.kind))
            .collect();

        for (pos, ids) in &rb.logger_ids {
            consumers[*pos].set_log_ids(ids);
            for &log_id in ids {
                self.dispatcher.add_persistent(HandlerKey::new(
                    modules::LOGGING,
                    protocol::logging::READOUT_NOTIFY,
                    Some(log_id),
                ));
                self.log_index.insert(log_id, (route_id, *pos));
            }
        }
        if !rb.logger_ids.is_empty() && !self.log_download_enabled {
            let enable = [
                protocol::command(modules::LOGGING, protocol::logging::ENABLE, &[1]),
                protocol::command(modules::LOGGING, protocol::logging::READOUT_NOTIFY, &[1]),
            ];
            for frame in &enable {
                if let Err(e) = self.send(frame) {
                    tracing::warn!(error = %e, "failed to enable log download");
                }
            }
            self.log_download_enabled = true;
        }

        for (pos, consumer) in consumers.iter().enumerate() {
            if consumer.kind() == ConsumerKind::Stream {
                let node = self.arena.get(consumer.descriptor());
                let key = HandlerKey::new(node.module, node.base_register(), node.instance);
                self.streams.entry(key).or_default().push((route_id, pos));
            }
        }

        let names: Vec<String> = rb.state.names.iter().map(|(n, _)| n.clone()).collect();
        let route = Route::new(
            route_id,
            consumers,
            rb.processor_ids.clone(),
            rb.event_ids.clone(),
            names,
        );
        tracing::info!(
            route = route_id.0,
            processors = rb.processor_ids.len(),
            events = rb.event_ids.len(),
            "route provisioned"
        );
        self.registry.insert_route(route);
        rb.done.resolve(Ok(route_id));
        self.start_next();
    }

    /// Remove every firmware object a partially built route created in the
    /// phases preceding `rb.phase`. The failing engine rolls back its own
    /// batch; ids of the current phase are not recorded here yet.
    fn rollback_route_build(&mut self, rb: &RouteBuild) {
        for (_, ids) in rb.logger_ids.iter().rev() {
            for &id in ids.iter().rev() {
                let _ = self.send(&logger::remove_frame(id));
            }
        }
        for &id in rb.event_ids.iter().rev() {
            let _ = self.send(&event::remove_frame(id));
        }
        if rb.phase != Phase::Processors {
            // processor_ids holds placeholder zeros until that phase completes
            for &id in rb.processor_ids.iter().rev() {
                self.active_processors.remove(&id);
                let _ = self.send(&processor::remove_frame(id));
            }
        }
    }

    fn fail_active(&mut self, error: LinkError) {
        let Some(construction) = self.active.take() else {
            return;
        };
        match construction {
            Construction::Route(mut rb) => {
                self.rollback_route_build(&rb);
                rb.done.resolve(Err(error));
            }
            Construction::Observer { mut done } => done.resolve(Err(error)),
            Construction::Timer { mut done, .. } => done.resolve(Err(error)),
        }
        self.start_next();
    }

    // ----- inbound -------------------------------------------------------

    /// Single mutation entry point for inbound notification frames
    pub fn on_notification(&mut self, frame: &[u8]) {
        match self.dispatcher.classify(frame) {
            Inbound::Data { key, payload } => {
                if key.module == modules::LOGGING
                    && key.register == protocol::logging::READOUT_NOTIFY
                {
                    if let Some(log_id) = key.instance {
                        self.deliver_log_chunk(log_id, payload);
                    }
                } else {
                    self.deliver_stream(key, payload);
                }
            }
            Inbound::Ack {
                module,
                register: _,
                payload,
            } => {
                let Some(&id) = payload.first() else {
                    tracing::debug!(module, "acknowledgement without an id, dropping");
                    return;
                };
                let now = self.clock.now();
                let timeout = self.config.ack_timeout();
                let Some(engine) = self.engine_mut(module) else {
                    return;
                };
                let step = engine.handle(EngineEvent::Ack(id), now, timeout);
                self.drive(module, step);
            }
            Inbound::ModuleInfo { module, payload } => {
                let info = ModuleInfo {
                    module,
                    implementation: payload.first().copied().unwrap_or(0),
                    revision: payload.get(1).copied().unwrap_or(0),
                    extra: payload.get(2..).unwrap_or_default().to_vec(),
                };
                tracing::debug!(module, revision = info.revision, "module discovered");
                self.module_info.insert(module, info.clone());
                if let Some(waiters) = self.pending_module_reads.remove(&module) {
                    for mut done in waiters {
                        done.resolve(Ok(info.clone()));
                    }
                }
            }
            Inbound::Dropped => {}
        }
    }

    fn deliver_stream(&mut self, key: HandlerKey, payload: &[u8]) {
        let Some(targets) = self.streams.get(&key).cloned() else {
            return;
        };
        for (route_id, position) in targets {
            let Some(route) = self.registry.route_mut(route_id) else {
                continue;
            };
            let Ok(consumer) = route.consumer_mut(position) else {
                continue;
            };
            if !consumer.is_subscribed() {
                continue;
            }
            let node = self.arena.get(consumer.descriptor());
            match codec::decode(payload, &node.layout, node.scale) {
                Ok(value) => consumer.deliver(value),
                Err(e) => tracing::warn!(error = %e, "undecodable stream payload"),
            }
        }
    }

    fn deliver_log_chunk(&mut self, log_id: u8, chunk: &[u8]) {
        let Some(&(route_id, position)) = self.log_index.get(&log_id) else {
            return;
        };
        let Some(route) = self.registry.route_mut(route_id) else {
            return;
        };
        let Ok(consumer) = route.consumer_mut(position) else {
            return;
        };
        if let Some(row) = consumer.accept_log_chunk(log_id, chunk) {
            let node = self.arena.get(consumer.descriptor());
            // Merged rows start at the payload, not the frame body
            let mut layout = node.layout.clone();
            layout.offset = 0;
            match codec::decode(&row, &layout, node.scale) {
                Ok(value) => consumer.deliver(value),
                Err(e) => tracing::warn!(error = %e, "undecodable log row"),
            }
        }
    }

    /// Fire `TimedOut` into any engine whose deadline has passed. Call this
    /// periodically from the host's event loop.
    pub fn process_timeouts(&mut self) {
        let now = self.clock.now();
        let timeout = self.config.ack_timeout();
        for module in [
            modules::DATA_PROCESSOR,
            modules::LOGGING,
            modules::EVENT,
            modules::TIMER,
        ] {
            let expired = self
                .engine_mut(module)
                .and_then(|e| e.deadline())
                .is_some_and(|deadline| now >= deadline);
            if expired {
                let step = self
                    .engine_mut(module)
                    .expect("engine exists")
                    .handle(EngineEvent::TimedOut, now, timeout);
                self.drive(module, step);
            }
        }
    }

    // ----- subscriptions -------------------------------------------------

    /// Open a subscriber channel on the consumer at `position`. The first
    /// subscriber on a signal enables its firmware notifications; calling
    /// again replaces the channel without another enable round trip.
    pub fn subscribe(&mut self, route_id: RouteId, position: usize) -> Result<Subscriber> {
        let route = self
            .registry
            .route_mut(route_id)
            .ok_or_else(|| LinkError::InvalidRoute(format!("no route {route_id:?}")))?;
        let consumer = route.consumer_mut(position)?;
        let desc = consumer.descriptor();
        let kind = consumer.kind();
        let was_subscribed = consumer.is_subscribed();
        let receiver = consumer.attach();

        if kind == ConsumerKind::Stream && !was_subscribed {
            let node = self.arena.get(desc);
            let key = HandlerKey::new(node.module, node.base_register(), node.instance);
            let enable = node.enable;
            let module = node.module;
            let instance = node.instance;
            if self.dispatcher.add_persistent(key) == 1 {
                if let Some(enable) = enable {
                    let frame = if enable.per_instance {
                        protocol::instance_command(
                            module,
                            enable.register,
                            instance.unwrap_or(NO_INSTANCE),
                            &[1],
                        )
                    } else {
                        protocol::command(module, enable.register, &[1])
                    };
                    self.send(&frame)?;
                }
                self.arena.mark_live(desc);
            }
        }
        Ok(receiver)
    }

    /// Close the consumer's subscriber channel; the last subscriber on a
    /// signal silences its firmware notifications.
    pub fn unsubscribe(&mut self, route_id: RouteId, position: usize) -> Result<()> {
        let route = self
            .registry
            .route_mut(route_id)
            .ok_or_else(|| LinkError::InvalidRoute(format!("no route {route_id:?}")))?;
        let consumer = route.consumer_mut(position)?;
        if !consumer.is_subscribed() {
            return Ok(());
        }
        let desc = consumer.descriptor();
        let kind = consumer.kind();
        consumer.detach();

        if kind == ConsumerKind::Stream {
            let node = self.arena.get(desc);
            let key = HandlerKey::new(node.module, node.base_register(), node.instance);
            let enable = node.enable;
            let module = node.module;
            let instance = node.instance;
            if self.dispatcher.remove_persistent(key) == 0 {
                if let Some(enable) = enable {
                    let frame = if enable.per_instance {
                        protocol::instance_command(
                            module,
                            enable.register,
                            instance.unwrap_or(NO_INSTANCE),
                            &[0],
                        )
                    } else {
                        protocol::command(module, enable.register, &[0])
                    };
                    self.send(&frame)?;
                }
                self.arena.mark_silent(desc);
            }
        }
        Ok(())
    }

    // ----- removal -------------------------------------------------------

    /// Remove a route and everything it provisioned. Removing an already
    /// removed route is a no-op.
    pub fn remove_route(&mut self, route_id: RouteId) -> Result<()> {
        self.teardown_route(route_id, true)
    }

    fn teardown_route(&mut self, route_id: RouteId, with_firmware: bool) -> Result<()> {
        let Some(route) = self.registry.route_mut(route_id) else {
            return Ok(());
        };
        if !route.invalidate() {
            return Ok(());
        }
        let mut route = self
            .registry
            .remove_route(route_id)
            .expect("route present under its own id");

        // Silence and detach every consumer first
        let endpoints: Vec<(DescId, ConsumerKind, bool, Vec<u8>)> = route
            .consumers_mut()
            .map(|c| {
                let subscribed = c.is_subscribed();
                c.detach();
                (c.descriptor(), c.kind(), subscribed, c.log_ids())
            })
            .collect();
        for (desc, kind, subscribed, log_ids) in endpoints {
            match kind {
                ConsumerKind::Stream => {
                    if subscribed {
                        let node = self.arena.get(desc);
                        let key = HandlerKey::new(node.module, node.base_register(), node.instance);
                        let enable = node.enable;
                        let module = node.module;
                        let instance = node.instance;
                        if self.dispatcher.remove_persistent(key) == 0 {
                            if with_firmware {
                                if let Some(enable) = enable {
                                    let frame = if enable.per_instance {
                                        protocol::instance_command(
                                            module,
                                            enable.register,
                                            instance.unwrap_or(NO_INSTANCE),
                                            &[0],
                                        )
                                    } else {
                                        protocol::command(module, enable.register, &[0])
                                    };
                                    let _ = self.send(&frame);
                                }
                            }
                            self.arena.mark_silent(desc);
                        }
                    }
                }
                ConsumerKind::Log => {
                    for log_id in log_ids {
                        self.dispatcher.remove_persistent(HandlerKey::new(
                            modules::LOGGING,
                            protocol::logging::READOUT_NOTIFY,
                            Some(log_id),
                        ));
                        self.log_index.remove(&log_id);
                        if with_firmware {
                            let _ = self.send(&logger::remove_frame(log_id));
                        }
                    }
                }
            }
        }

        for &id in route.events.iter().rev() {
            if with_firmware {
                let _ = self.send(&event::remove_frame(id));
            }
        }
        for &id in route.processors.iter().rev() {
            self.active_processors.remove(&id);
            if with_firmware {
                let _ = self.send(&processor::remove_frame(id));
            }
        }

        for targets in self.streams.values_mut() {
            targets.retain(|(rid, _)| *rid != route_id);
        }
        self.streams.retain(|_, targets| !targets.is_empty());
        self.registry.release_names(&route.names);
        tracing::info!(route = route_id.0, "route removed");
        Ok(())
    }

    /// Remove an observer's firmware event entries; idempotent
    pub fn remove_observer(&mut self, observer_id: ObserverId) -> Result<()> {
        let Some(mut observer) = self.registry.remove_observer(observer_id) else {
            return Ok(());
        };
        observer.invalidate();
        for &id in observer.events.iter().rev() {
            self.send(&event::remove_frame(id))?;
        }
        Ok(())
    }

    // ----- timers --------------------------------------------------------

    pub fn start_timer(&mut self, timer_id: TimerId) -> Result<()> {
        let timer = self
            .registry
            .timer(timer_id)
            .ok_or_else(|| LinkError::InvalidRoute(format!("no timer {timer_id:?}")))?;
        let frame = [modules::TIMER, protocol::timer::START, timer.firmware_id];
        self.send(&frame)
    }

    pub fn stop_timer(&mut self, timer_id: TimerId) -> Result<()> {
        let timer = self
            .registry
            .timer(timer_id)
            .ok_or_else(|| LinkError::InvalidRoute(format!("no timer {timer_id:?}")))?;
        let frame = [modules::TIMER, protocol::timer::STOP, timer.firmware_id];
        self.send(&frame)
    }

    /// Remove a timer from the firmware; idempotent
    pub fn remove_timer(&mut self, timer_id: TimerId) -> Result<()> {
        let Some(timer) = self.registry.timer_mut(timer_id) else {
            return Ok(());
        };
        if !timer.invalidate() {
            return Ok(());
        }
        let timer = self
            .registry
            .remove_timer(timer_id)
            .expect("timer present under its own id");
        self.send(&[modules::TIMER, protocol::timer::REMOVE, timer.firmware_id])
    }

    /// Trigger signal of a provisioned timer, for observer reactions
    pub fn timer_trigger(&self, timer_id: TimerId) -> Result<DescId> {
        self.registry
            .timer(timer_id)
            .map(|t| t.trigger())
            .ok_or_else(|| LinkError::InvalidRoute(format!("no timer {timer_id:?}")))
    }

    // ----- processor editing ---------------------------------------------

    /// Re-configure a provisioned processor in place. The new config must be
    /// of the same kind as the one it replaces.
    pub fn set_processor_parameters(
        &mut self,
        processor_id: u8,
        config: ProcessorConfig,
    ) -> Result<()> {
        let dp_rev = self.module_revision(modules::DATA_PROCESSOR);
        let frame = self
            .active_processors
            .get_mut(&processor_id)
            .ok_or_else(|| {
                LinkError::InvalidRoute(format!("no active processor with id {processor_id}"))
            })?
            .set_parameters(config, dp_rev)?;
        self.send(&frame)
    }

    pub fn active_processor(&self, processor_id: u8) -> Option<&ActiveProcessor> {
        self.active_processors.get(&processor_id)
    }

    // ----- disconnect & persistence --------------------------------------

    /// Handle a dropped link: every outstanding promise fails with
    /// [`LinkError::Disconnected`] and all host-side state is torn down
    /// without firmware traffic.
    pub fn handle_disconnect(&mut self) {
        tracing::warn!("link dropped, failing outstanding operations");
        self.connected = false;
        self.fail_active(LinkError::Disconnected);
        while let Some(request) = self.queue.pop_front() {
            match request {
                Request::Route { mut done, .. } => done.resolve(Err(LinkError::Disconnected)),
                Request::Observer { mut done, .. } => done.resolve(Err(LinkError::Disconnected)),
                Request::Timer { mut done, .. } => done.resolve(Err(LinkError::Disconnected)),
            }
        }
        for (_, waiters) in self.pending_module_reads.drain() {
            for mut done in waiters {
                done.resolve(Err(LinkError::Disconnected));
            }
        }
        let route_ids = self.registry.route_ids();
        for route_id in route_ids {
            let _ = self.teardown_route(route_id, false);
        }
        for route in self.registry.drain_routes() {
            drop(route);
        }
        self.streams.clear();
        self.log_index.clear();
        self.active_processors.clear();
        self.dispatcher = Dispatcher::new();
        self.transport.disconnect();
    }

    /// Capture the state worth persisting across reconnects
    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            arena: self.arena.clone(),
            modules: self.module_info.clone(),
        }
    }

    /// Restore a snapshot into a fresh connection. Live flags are cleared;
    /// routes, subscriptions and firmware ids never survive a reconnect.
    pub fn restore_transient(&mut self, snapshot: BoardSnapshot) {
        self.arena = snapshot.arena;
        self.arena.mark_all_silent();
        self.module_info = snapshot.modules;
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(LinkError::Disconnected);
        }
        tracing::trace!(?frame, "tx");
        self.transport.send_frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBoard, MockHandle};

    fn board() -> (Board, MockHandle, Arc<ManualClock>) {
        let (transport, handle) = MockBoard::new();
        let clock = ManualClock::new();
        let board = Board::with_clock(Box::new(transport), LinkConfig::default(), clock.clone());
        (board, handle, clock)
    }

    fn pump(board: &mut Board, handle: &MockHandle) {
        loop {
            let frames = handle.take_notifications();
            if frames.is_empty() {
                break;
            }
            for frame in frames {
                board.on_notification(&frame);
            }
        }
    }

    fn accel(board: &mut Board) -> DescId {
        board.register_sensor(
            0x03,
            0x04,
            Layout::vector(2, 3, true),
            16384.0,
            SignalClass::Sensor,
            Some(Enable {
                register: 0x02,
                per_instance: false,
            }),
        )
    }

    #[test]
    fn test_discover_module_caches() {
        let (mut board, handle, _clock) = board();
        let mut first = board.discover_module(0x09);
        assert!(first.try_take().is_none());
        pump(&mut board, &handle);
        let info = first.try_take().unwrap().unwrap();
        assert_eq!(info.revision, 2);

        // Second read answers from the cache without touching the wire
        handle.clear_sent();
        let mut second = board.discover_module(0x09);
        assert!(matches!(second.try_take(), Some(Ok(_))));
        assert!(handle.sent_frames().is_empty());
    }

    #[test]
    fn test_simple_stream_route_resolves_without_traffic() {
        let (mut board, handle, _clock) = board();
        let source = accel(&mut board);
        let mut result = board.add_route(source, |c| c.stream().map(|_| ()));
        // No processors, loggers or events to provision
        let route_id = result.try_take().unwrap().unwrap();
        assert!(handle.sent_frames().is_empty());
        assert!(board.registry().route(route_id).is_some());
    }

    #[test]
    fn test_builder_failure_resolves_immediately() {
        let (mut board, _handle, _clock) = board();
        let source = accel(&mut board);
        let mut result = board.add_route(source, |c| c.index(0).map(|_| ()));
        assert!(matches!(
            result.try_take(),
            Some(Err(LinkError::InvalidRoute(_)))
        ));
    }

    #[test]
    fn test_stream_delivery_and_refcounted_enable() {
        let (mut board, handle, _clock) = board();
        let source = accel(&mut board);
        let mut result = board.add_route(source, |c| c.stream().map(|_| ()));
        let route_id = result.try_take().unwrap().unwrap();

        let rx = board.subscribe(route_id, 0).unwrap();
        // First subscriber enables the sensor
        assert_eq!(handle.sent_frames(), vec![vec![0x03, 0x02, 1]]);

        // x=0.5, y=-0.25, z=1.0 at scale 16384
        handle.emit(vec![0x03, 0x44, 0x00, 0x20, 0x00, 0xF0, 0x00, 0x40]);
        pump(&mut board, &handle);
        let value = rx.try_recv().unwrap();
        let lanes = value.as_lanes().unwrap();
        assert!((lanes[0] - 0.5).abs() < 1e-3);

        handle.clear_sent();
        board.unsubscribe(route_id, 0).unwrap();
        assert_eq!(handle.sent_frames(), vec![vec![0x03, 0x02, 0]]);

        // Unsubscribed consumers drop frames silently
        handle.emit(vec![0x03, 0x44, 0, 0, 0, 0, 0, 0]);
        pump(&mut board, &handle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fifo_queues_constructions() {
        let (mut board, handle, _clock) = board();
        let source = accel(&mut board);
        board.discover_core_modules();
        pump(&mut board, &handle);

        let mut first = board.add_route(source, |c| {
            c.split()?.index(0)?.average(4)?.stream()?.end().map(|_| ())
        });
        let mut second = board.add_route(source, |c| c.count()?.stream().map(|_| ()));

        // First construction is mid-flight, second still queued
        assert!(first.try_take().is_none());
        assert!(second.try_take().is_none());

        pump(&mut board, &handle);
        assert!(first.try_take().unwrap().is_ok());
        assert!(second.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_timeout_rolls_back_and_frees_firmware_slots() {
        let (mut board, handle, clock) = board();
        let source = accel(&mut board);
        board.discover_core_modules();
        pump(&mut board, &handle);

        handle.suppress(0x09, 0x02);
        let mut result = board.add_route(source, |c| c.count()?.stream().map(|_| ()));
        assert!(result.try_take().is_none());

        clock.advance(Duration::from_millis(300));
        board.process_timeouts();
        pump(&mut board, &handle);

        assert!(matches!(result.try_take(), Some(Err(LinkError::Timeout(_)))));
        assert!(handle.allocated_processors().is_empty());
        assert!(board.registry().route_ids().is_empty());
    }

    #[test]
    fn test_disconnect_fails_everything() {
        let (mut board, handle, _clock) = board();
        let source = accel(&mut board);
        board.discover_core_modules();
        pump(&mut board, &handle);

        handle.suppress(0x09, 0x02);
        let mut in_flight = board.add_route(source, |c| c.count()?.stream().map(|_| ()));
        let mut queued = board.schedule_task(1000, 0xFFFF, false);

        board.handle_disconnect();
        assert!(matches!(
            in_flight.try_take(),
            Some(Err(LinkError::Disconnected))
        ));
        assert!(matches!(
            queued.try_take(),
            Some(Err(LinkError::Disconnected))
        ));
        assert!(handle.is_disconnected());

        // New requests fail fast while disconnected
        let mut late = board.add_route(source, |c| c.stream().map(|_| ()));
        assert!(matches!(
            late.try_take(),
            Some(Err(LinkError::Disconnected))
        ));
    }

    #[test]
    fn test_timer_lifecycle() {
        let (mut board, handle, _clock) = board();
        let mut result = board.schedule_task(500, 10, true);
        pump(&mut board, &handle);
        let timer_id = result.try_take().unwrap().unwrap();
        assert_eq!(handle.allocated_timers(), vec![0]);

        handle.clear_sent();
        board.start_timer(timer_id).unwrap();
        board.stop_timer(timer_id).unwrap();
        board.remove_timer(timer_id).unwrap();
        assert_eq!(
            handle.sent_frames(),
            vec![
                vec![0x0C, 0x03, 0],
                vec![0x0C, 0x04, 0],
                vec![0x0C, 0x05, 0],
            ]
        );
        assert!(handle.allocated_timers().is_empty());
        // Idempotent
        board.remove_timer(timer_id).unwrap();
    }

    #[test]
    fn test_transport_error_surfaces_to_subscribe() {
        let mut transport = crate::transport::MockTransport::new();
        transport
            .expect_send_frame()
            .returning(|_| Err(LinkError::Transport("gatt write failed".to_string())));
        let mut board = Board::new(Box::new(transport), LinkConfig::default());
        let source = accel(&mut board);

        // Route creation needs no traffic, the enable on subscribe does
        let mut result = board.add_route(source, |c| c.stream().map(|_| ()));
        let route_id = result.try_take().unwrap().unwrap();
        let err = board.subscribe(route_id, 0).unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
    }

    #[test]
    fn test_snapshot_restore_clears_live_bits() {
        let (mut board, handle, _clock) = board();
        let source = accel(&mut board);
        board.discover_core_modules();
        pump(&mut board, &handle);

        let mut result = board.add_route(source, |c| c.stream().map(|_| ()));
        let route_id = result.try_take().unwrap().unwrap();
        board.subscribe(route_id, 0).unwrap();
        assert!(board.descriptor(source).is_live());

        let json = board.snapshot().to_json().unwrap();
        let snapshot = BoardSnapshot::from_json(&json).unwrap();
        let (transport2, _handle2) = MockBoard::new();
        let mut board2 = Board::new(Box::new(transport2), LinkConfig::default());
        board2.restore_transient(snapshot);
        assert!(!board2.descriptor(source).is_live());
        assert_eq!(board2.module_info(0x09).unwrap().revision, 2);
    }
}
