//! Multi-node bench.
//!
//! A [`Bench`] runs one [`Engine`] and one [`Application`] per node over a
//! shared [`Fabric`]. It owns the event queue and routes its entries:
//! engine continuations go back to [`Engine::dispatch`], call returns resume
//! the node's application, and fabric events are turned into NIC
//! notifications.
//!
//! # Example
//!
//! ```
//! use msgsim::app::{Call, MsgArgs};
//! use msgsim::heap::SimAddr;
//! use msgsim::request::Datatype;
//! use msgsim_util::bench::BenchBuilder;
//! use msgsim_util::helper_models::{Op, Script};
//!
//! let buf = SimAddr::new(0x10_0000);
//! let sender = Script::new(vec![Op::Call(Call::Send(MsgArgs::new(buf, 16, Datatype::Int, 1, 5)))]);
//! let receiver = Script::new(vec![Op::Call(Call::Recv(MsgArgs::new(buf, 16, Datatype::Int, 0, 5)))]);
//!
//! let mut bench = BenchBuilder::new().add_app(sender).add_app(receiver).build()?;
//! let report = bench.run()?;
//!
//! assert_eq!(report.stats[1].matched, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::error::Error;
use std::fmt;

use msgsim::app::{Application, CallReturn};
use msgsim::config::EngineConfig;
use msgsim::engine::{Action, Context, Engine, EngineError, FatalError, Step};
use msgsim::group::Groups;
use msgsim::nic::NodeId;
use msgsim::simulation::EventQueue;
use msgsim::stats::EngineStats;
use msgsim::time::MonotonicTime;

use crate::fabric::{Fabric, FabricConfig, FabricError, FabricEvent};

/// Entry of the bench event queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Initialize the engine of a node.
    Start(NodeId),
    /// Run an engine continuation.
    Step(NodeId, Step),
    /// Resume an application.
    Return(NodeId, CallReturn),
    /// Apply a fabric event.
    Fabric(FabricEvent),
}

struct Node {
    engine: Engine,
    app: Box<dyn Application>,
    span: tracing::Span,
    finished: bool,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("engine", &self.engine)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Builder of a [`Bench`].
///
/// Applications are attached in rank order: the `i`-th application runs as
/// world rank `i` on node `i`.
#[derive(Default)]
pub struct BenchBuilder {
    config: EngineConfig,
    fabric: FabricConfig,
    apps: Vec<Box<dyn Application>>,
    start: Option<MonotonicTime>,
}

impl BenchBuilder {
    /// Creates a builder with default engine and fabric parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the engine configuration shared by all nodes.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the fabric parameters.
    pub fn with_fabric(mut self, fabric: FabricConfig) -> Self {
        self.fabric = fabric;
        self
    }

    /// Sets the time at which engines are initialized.
    pub fn with_start_time(mut self, start: MonotonicTime) -> Self {
        self.start = Some(start);
        self
    }

    /// Attaches the application of the next rank.
    pub fn add_app<A: Application + 'static>(mut self, app: A) -> Self {
        self.apps.push(Box::new(app));
        self
    }

    /// Builds the bench.
    pub fn build(self) -> Result<Bench, EngineError> {
        let start = self.start.unwrap_or(MonotonicTime::EPOCH);
        let world: Vec<NodeId> = (0..self.apps.len() as NodeId).collect();
        let mut queue = EventQueue::new(start);

        let mut nodes = Vec::with_capacity(self.apps.len());
        for (node, app) in world.iter().copied().zip(self.apps) {
            let groups = Groups::world(node, world.clone());
            let engine = Engine::new(node, self.config.clone(), groups)?;
            let span = tracing::debug_span!("node", node, rank = engine.rank());
            queue.schedule(std::time::Duration::ZERO, Event::Start(node));
            nodes.push(Node {
                engine,
                app,
                span,
                finished: false,
            });
        }

        Ok(Bench {
            fabric: Fabric::new(nodes.len(), self.fabric),
            nodes,
            queue,
        })
    }
}

impl fmt::Debug for BenchBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchBuilder")
            .field("config", &self.config)
            .field("fabric", &self.fabric)
            .field("apps", &self.apps.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of a completed run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    /// Time of the last event.
    pub end_time: MonotonicTime,
    /// Statistics of each node, by node id.
    pub stats: Vec<EngineStats>,
}

/// Error aborting a run.
#[derive(Debug)]
pub enum ExecutionError {
    /// An engine hit a fatal error.
    Fatal(FatalError),
    /// An engine misused the fabric.
    Fabric(FabricError),
    /// An event targeted a node that does not exist.
    UnknownNode(NodeId),
    /// The queue drained while the applications of these nodes were still
    /// waiting for a call to return.
    Deadlock(Vec<NodeId>),
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal(e) => write!(f, "{}", e),
            Self::Fabric(e) => write!(f, "fabric fault: {}", e),
            Self::UnknownNode(node) => write!(f, "no node with id {}", node),
            Self::Deadlock(nodes) => {
                write!(f, "simulation deadlocked with blocked nodes {:?}", nodes)
            }
        }
    }
}

impl Error for ExecutionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Fatal(e) => Some(e),
            Self::Fabric(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FatalError> for ExecutionError {
    fn from(e: FatalError) -> Self {
        Self::Fatal(e)
    }
}

impl From<FabricError> for ExecutionError {
    fn from(e: FabricError) -> Self {
        Self::Fabric(e)
    }
}

/// Engines, applications and fabric of a simulated machine.
#[derive(Debug)]
pub struct Bench {
    nodes: Vec<Node>,
    fabric: Fabric,
    queue: EventQueue<Event>,
}

impl Bench {
    /// Current simulation time.
    pub fn time(&self) -> MonotonicTime {
        self.queue.time()
    }

    /// The engine of `node`.
    pub fn engine(&self, node: NodeId) -> Option<&Engine> {
        self.nodes.get(node as usize).map(|n| &n.engine)
    }

    /// The fabric.
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Returns `true` once the application of `node` has finished.
    pub fn is_finished(&self, node: NodeId) -> bool {
        self.nodes.get(node as usize).is_some_and(|n| n.finished)
    }

    /// Processes the next event; returns `false` if the queue was empty.
    pub fn step(&mut self) -> Result<bool, ExecutionError> {
        let Some((time, event)) = self.queue.pop() else {
            return Ok(false);
        };

        match event {
            Event::Start(node) => self.with_engine(node, |e, cx| e.init(cx))?,
            Event::Step(node, step) => self.with_engine(node, |e, cx| e.dispatch(step, cx))?,
            Event::Return(node, ret) => self.resume(node, ret)?,
            Event::Fabric(FabricEvent::Arrive {
                src,
                dest,
                tag,
                pkt,
                ..
            }) => {
                self.fabric.arrive(time, src, dest, tag, pkt)?;
                self.drain_fabric()?;
            }
            Event::Fabric(FabricEvent::Notify { node, n }) => {
                self.with_engine(node, |e, cx| e.notify(n, cx))?
            }
        }

        Ok(true)
    }

    /// Processes all events scheduled up to and including `deadline`.
    pub fn step_until(&mut self, deadline: MonotonicTime) -> Result<(), ExecutionError> {
        while self.queue.peek_time().is_some_and(|t| t <= deadline) {
            self.step()?;
        }

        Ok(())
    }

    /// Runs until the queue drains.
    ///
    /// Fails with [`ExecutionError::Deadlock`] if an application is still
    /// waiting for a call to return once nothing is left to happen.
    pub fn run(&mut self) -> Result<Report, ExecutionError> {
        while self.step()? {}

        let blocked: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| !n.finished)
            .map(|n| n.engine.node())
            .collect();
        if !blocked.is_empty() {
            tracing::error!(?blocked, "simulation deadlocked");
            return Err(ExecutionError::Deadlock(blocked));
        }

        let stats = self
            .nodes
            .iter()
            .map(|n| {
                let _enter = n.span.enter();
                n.engine.finish()
            })
            .collect();

        Ok(Report {
            end_time: self.queue.time(),
            stats,
        })
    }

    fn resume(&mut self, node: NodeId, ret: CallReturn) -> Result<(), ExecutionError> {
        let time = self.queue.time();
        let n = self
            .nodes
            .get_mut(node as usize)
            .ok_or(ExecutionError::UnknownNode(node))?;

        let next = {
            let _enter = n.span.enter();
            match ret {
                CallReturn::Init => n.app.start(time),
                ret => n.app.resume(ret, time),
            }
        };

        match next {
            Some(call) => self.with_engine(node, |e, cx| e.call(call, cx)),
            None => {
                tracing::debug!(node, "application finished");
                n.finished = true;
                Ok(())
            }
        }
    }

    /// Runs an engine entry point and queues what it left behind.
    fn with_engine<F>(&mut self, node: NodeId, f: F) -> Result<(), ExecutionError>
    where
        F: FnOnce(&mut Engine, &mut Context<'_>) -> Result<(), FatalError>,
    {
        let time = self.queue.time();
        let n = self
            .nodes
            .get_mut(node as usize)
            .ok_or(ExecutionError::UnknownNode(node))?;

        let mut actions = Vec::new();
        let mut port = self.fabric.port(node, time);
        {
            let _enter = n.span.enter();
            let mut cx = Context::new(time, &mut port, &mut actions);
            f(&mut n.engine, &mut cx)?;
        }

        for action in actions {
            match action {
                Action::Schedule { delay, step } => {
                    self.queue.schedule(delay, Event::Step(node, step))
                }
                Action::Return { delay, ret } => self.queue.schedule(delay, Event::Return(node, ret)),
            }
        }

        self.drain_fabric()
    }

    fn drain_fabric(&mut self) -> Result<(), ExecutionError> {
        if let Some(e) = self.fabric.take_fault() {
            return Err(e.into());
        }
        for (time, event) in self.fabric.drain() {
            self.queue.push(time, Event::Fabric(event));
        }

        Ok(())
    }
}
