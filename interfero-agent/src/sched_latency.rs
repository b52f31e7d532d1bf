//! aya backed scheduler latency tracing session

use crate::trace::{Attachments, SessionOpener, TraceSession, TracepointPrograms};
use aya::maps::HashMap as BpfHashMap;
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::TracePoint;
use aya::{Btf, Ebpf, EbpfLoader, Endianness};
use interfero::ebpf::{BtfSource, CgroupLatencyReader, Tracepoint};
use interfero::{InterferoError, MultiError, Result};
use interfero_common::{maps, CgroupNameKey};
use log::{info, warn};
use object::{Object, ObjectSection};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Opens sessions from the embedded program or an object file on disk
pub struct AyaSessionOpener {
    btf_dir: PathBuf,
    probe_path: PathBuf,
}

impl AyaSessionOpener {
    pub fn new(btf_dir: &Path, probe_path: &Path) -> Self {
        Self {
            btf_dir: btf_dir.to_path_buf(),
            probe_path: probe_path.to_path_buf(),
        }
    }

    #[cfg(embedded_probe)]
    fn program_bytes(&self) -> Result<std::borrow::Cow<'static, [u8]>> {
        Ok(std::borrow::Cow::Borrowed(aya::include_bytes_aligned!(
            concat!(env!("OUT_DIR"), "/sched_latency")
        )))
    }

    #[cfg(not(embedded_probe))]
    fn program_bytes(&self) -> Result<std::borrow::Cow<'static, [u8]>> {
        std::fs::read(&self.probe_path)
            .map(std::borrow::Cow::Owned)
            .map_err(|e| {
                InterferoError::ProgramLoadFailed(format!(
                    "read {}: {}",
                    self.probe_path.display(),
                    e
                ))
            })
    }
}

impl SessionOpener for AyaSessionOpener {
    fn btf_source(&self) -> Result<BtfSource> {
        BtfSource::detect(&self.btf_dir)
    }

    fn open(&self, btf: &BtfSource) -> Result<Box<dyn TraceSession>> {
        let bytes = self.program_bytes()?;
        Ok(Box::new(SchedLatencySession::open(&bytes, btf)?))
    }
}

/// One loaded and attached copy of the scheduler latency program.
///
/// Fields are filled in as `open` progresses, so dropping a half-opened
/// session releases exactly what was acquired.
pub struct SchedLatencySession {
    ebpf: Option<Ebpf>,
    attachments: Attachments<TracePointLinkId>,
    btf_file: Option<File>,
}

impl SchedLatencySession {
    pub fn open(program: &[u8], btf: &BtfSource) -> Result<Self> {
        remove_memlock_limit()?;

        let mut session = Self {
            ebpf: None,
            attachments: Attachments::new(),
            btf_file: None,
        };

        let external_btf = match btf {
            BtfSource::Embedded => None,
            BtfSource::External { path, release } => {
                let mut file = File::open(path).map_err(|_| InterferoError::BtfFileMissing {
                    path: path.display().to_string(),
                    release: release.clone(),
                })?;
                let mut raw = Vec::new();
                file.read_to_end(&mut raw)?;
                session.btf_file = Some(file);
                let parsed = Btf::parse(btf_section(&raw)?, Endianness::default()).map_err(|e| {
                    InterferoError::EbpfError(format!("parse {}: {}", path.display(), e))
                })?;
                Some(parsed)
            }
        };

        let mut loader = EbpfLoader::new();
        if let Some(btf) = external_btf.as_ref() {
            loader.btf(Some(btf));
        }
        let ebpf = session
            .ebpf
            .insert(loader.load(program).map_err(|e| {
                InterferoError::ProgramLoadFailed(format!("load sched latency object: {}", e))
            })?);

        session.attachments.attach_all(ebpf)?;

        info!(
            "Scheduler latency program attached ({} type metadata)",
            if btf.is_embedded() { "kernel" } else { "external" }
        );
        Ok(session)
    }

    fn read_table(
        ebpf: &Ebpf,
        name: &str,
        errors: &mut MultiError,
        mut observe: impl FnMut(&CgroupNameKey, u64),
    ) {
        let map_err = |reason: String| InterferoError::MapReadFailed {
            map: name.to_string(),
            reason,
        };

        let Some(map) = ebpf.map(name) else {
            errors.push(map_err("not found in object".to_string()));
            return;
        };
        let table = match BpfHashMap::<_, CgroupNameKey, u64>::try_from(map) {
            Ok(table) => table,
            Err(e) => {
                errors.push(map_err(e.to_string()));
                return;
            }
        };

        // Keyed lookups by byte-array name are unreliable; walk the whole table.
        for entry in table.iter() {
            match entry {
                Ok((key, value)) => observe(&key, value),
                Err(e) => errors.push(map_err(e.to_string())),
            }
        }
    }
}

impl TraceSession for SchedLatencySession {
    fn read_cgroup_averages(&mut self, names: &[String]) -> Result<HashMap<String, f64>> {
        let ebpf = self
            .ebpf
            .as_ref()
            .ok_or_else(|| InterferoError::EbpfError("session already closed".to_string()))?;

        let mut reader = CgroupLatencyReader::new(names);
        let mut errors = MultiError::new();
        Self::read_table(ebpf, maps::OUTPUT_CGROUP_DELAY, &mut errors, |key, delay| {
            reader.observe_delay(key, delay)
        });
        Self::read_table(ebpf, maps::OUTPUT_CGROUP_COUNTER, &mut errors, |key, count| {
            reader.observe_switches(key, count)
        });
        errors.into_result()?;

        Ok(reader.averages())
    }

    fn close(&mut self) -> Result<()> {
        let mut errors = MultiError::new();

        if let Some(mut ebpf) = self.ebpf.take() {
            self.attachments.release(&mut ebpf, &mut errors);
            // Dropping the object closes the map descriptors.
            drop(ebpf);
        }

        // Closing the type description file cannot fail observably.
        self.btf_file.take();

        errors.into_result()
    }
}

impl Drop for SchedLatencySession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Releasing scheduler latency program: {}", e);
        }
    }
}

impl TracepointPrograms for Ebpf {
    type Link = TracePointLinkId;

    fn load(&mut self, tp: Tracepoint) -> Result<()> {
        tracepoint_mut(self, tp)?
            .load()
            .map_err(|e| InterferoError::ProgramLoadFailed(format!("{}: {}", tp, e)))
    }

    fn attach(&mut self, tp: Tracepoint) -> Result<TracePointLinkId> {
        tracepoint_mut(self, tp)?
            .attach(tp.category(), tp.as_str())
            .map_err(|e| InterferoError::AttachFailed(format!("{}: {}", tp, e)))
    }

    fn detach(&mut self, tp: Tracepoint, link: TracePointLinkId) -> Result<()> {
        tracepoint_mut(self, tp)?
            .detach(link)
            .map_err(|e| InterferoError::EbpfError(format!("detach {}: {}", tp, e)))
    }

    fn unload(&mut self, tp: Tracepoint) -> Result<()> {
        tracepoint_mut(self, tp)?
            .unload()
            .map_err(|e| InterferoError::EbpfError(format!("unload {}: {}", tp, e)))
    }
}

const ELF_MAGIC: &[u8] = b"\x7fELF";
const BTF_SECTION: &str = ".BTF";

/// Type description carried by a `vmlinux-<release>` file: the `.BTF`
/// section of an ELF image, or the whole file when it is raw BTF.
fn btf_section(raw: &[u8]) -> Result<&[u8]> {
    if !raw.starts_with(ELF_MAGIC) {
        return Ok(raw);
    }

    let elf = object::File::parse(raw)
        .map_err(|e| InterferoError::EbpfError(format!("parse vmlinux ELF: {}", e)))?;
    let section = elf.section_by_name(BTF_SECTION).ok_or_else(|| {
        InterferoError::EbpfError(format!("vmlinux ELF has no {} section", BTF_SECTION))
    })?;
    section
        .data()
        .map_err(|e| InterferoError::EbpfError(format!("read {} section: {}", BTF_SECTION, e)))
}

fn tracepoint_mut(ebpf: &mut Ebpf, tp: Tracepoint) -> Result<&mut TracePoint> {
    ebpf.program_mut(tp.program())
        .ok_or_else(|| {
            InterferoError::ProgramLoadFailed(format!("program {} not in object", tp.program()))
        })?
        .try_into()
        .map_err(|e| InterferoError::ProgramLoadFailed(format!("{}: {}", tp.program(), e)))
}

fn remove_memlock_limit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(InterferoError::EbpfError(format!(
            "remove memlock limit: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
