//! Kernel tracing session seam
//!
//! A session owns every kernel resource of one collection window. Only one is
//! open at a time and it is always closed, explicitly or on drop.

use interfero::ebpf::{BtfSource, Tracepoint};
use interfero::{MultiError, Result};
use log::debug;
use std::collections::HashMap;
use std::mem;

pub trait TraceSession: Send {
    /// Average schedule latency in ns per switch for every requested cgroup
    /// name; names the kernel never saw map to 0.0.
    fn read_cgroup_averages(&mut self, names: &[String]) -> Result<HashMap<String, f64>>;

    /// Release every kernel handle, reporting all failures together.
    /// Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

pub trait SessionOpener: Send + Sync {
    /// Where kernel type metadata comes from on this host
    fn btf_source(&self) -> Result<BtfSource>;

    fn open(&self, btf: &BtfSource) -> Result<Box<dyn TraceSession>>;
}

/// Per-tracepoint program operations of a loaded object
pub trait TracepointPrograms {
    type Link;

    fn load(&mut self, tp: Tracepoint) -> Result<()>;

    fn attach(&mut self, tp: Tracepoint) -> Result<Self::Link>;

    fn detach(&mut self, tp: Tracepoint, link: Self::Link) -> Result<()>;

    fn unload(&mut self, tp: Tracepoint) -> Result<()>;
}

/// What a session has loaded and attached so far.
///
/// Entries are recorded as each step succeeds, so a session that failed half
/// way through `attach_all` releases exactly what it acquired.
pub struct Attachments<L> {
    loaded: Vec<Tracepoint>,
    links: Vec<(Tracepoint, L)>,
}

impl<L> Attachments<L> {
    pub fn new() -> Self {
        Self {
            loaded: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.links.is_empty()
    }

    /// Load and attach every scheduler tracepoint in order
    pub fn attach_all<P>(&mut self, programs: &mut P) -> Result<()>
    where
        P: TracepointPrograms<Link = L>,
    {
        for tp in Tracepoint::ALL {
            programs.load(tp)?;
            self.loaded.push(tp);

            let link = programs.attach(tp)?;
            self.links.push((tp, link));
            debug!("Attached {} to {}", tp.program(), tp);
        }
        Ok(())
    }

    /// Detach every link, then unload every program. A failure is recorded
    /// and the remaining handles are still released.
    pub fn release<P>(&mut self, programs: &mut P, errors: &mut MultiError)
    where
        P: TracepointPrograms<Link = L>,
    {
        for (tp, link) in mem::take(&mut self.links) {
            errors.collect(programs.detach(tp, link));
        }
        for tp in mem::take(&mut self.loaded) {
            errors.collect(programs.unload(tp));
        }
    }
}

impl<L> Default for Attachments<L> {
    fn default() -> Self {
        Self::new()
    }
}
