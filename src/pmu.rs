//! Event name lookup.
//!
//! Names are resolved against three sources, in order:
//!
//! - the generic hardware and software events every kernel knows about,
//! - event aliases exported by PMU drivers under
//!   `/sys/bus/event_source/devices/<pmu>/events`,
//! - an optional perfmon style JSON event list.
//!
//! PMUs also carry the `format/` descriptions needed to encode
//! `pmu/term=value,.../` event strings.

use std::collections::HashMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::cpulist::parse_cpu_list;
use crate::error::{Error, Result};
use crate::perf::*;

pub const SYSFS_PMU_DIR: &str = "/sys/bus/event_source/devices";

/// Environment variable naming a JSON event list to load.
pub const EVENTMAP_ENV: &str = "EVSTAT_EVENTMAP";

/// An event name resolved to its encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    pub name: String,
    pub attr: EventAttr,
    /// CPUs the owning PMU counts on, `None` for every CPU.
    pub cpus: Option<Vec<u32>>,
}

/// Something that can turn event names into encodings.
pub trait EventDatabase {
    /// Look up a symbolic event name.
    fn lookup(&self, name: &str) -> Option<ResolvedEvent>;

    /// Find a PMU by its sysfs name, for `pmu/terms/` syntax.
    fn pmu(&self, name: &str) -> Option<&Pmu>;
}

const BUILTIN_EVENTS: &[(&str, u32, u64)] = &[
    ("instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
    ("cpu-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    ("cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    ("cache-references", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
    ("cache-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
    ("branch-instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("branches", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("branch-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
    ("bus-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BUS_CYCLES),
    ("stalled-cycles-frontend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
    ("stalled-cycles-backend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
    ("ref-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES),
    ("cpu-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
    ("task-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
    ("page-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
    ("faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
    ("context-switches", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
    ("cs", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
    ("cpu-migrations", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_MIGRATIONS),
    ("migrations", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_MIGRATIONS),
    ("minor-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MIN),
    ("major-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MAJ),
    ("alignment-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_ALIGNMENT_FAULTS),
    ("emulation-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_EMULATION_FAULTS),
];

/// Look up one of the generic events.
pub fn builtin_event(name: &str) -> Option<EventAttr> {
    BUILTIN_EVENTS
        .iter()
        .find(|(builtin, _, _)| *builtin == name)
        .map(|&(_, kind, config)| EventAttr::new(kind, config))
}

/// Parse `0x1f` or `31`.
pub fn parse_number(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Which attribute word a format field lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWord {
    Config,
    Config1,
    Config2,
}

impl ConfigWord {
    fn slot(self, attr: &mut EventAttr) -> &mut u64 {
        match self {
            ConfigWord::Config => &mut attr.config,
            ConfigWord::Config1 => &mut attr.config1,
            ConfigWord::Config2 => &mut attr.config2,
        }
    }
}

/// Bit placement of one named term, from a `format/<term>` file such as
/// `config:0-7,32-35`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatField {
    pub word: ConfigWord,
    pub bits: Vec<RangeInclusive<u32>>,
}

impl FormatField {
    pub fn parse(spec: &str) -> Option<FormatField> {
        let format_re = Regex::new(r"^(config[12]?):(\d+(?:-\d+)?(?:,\d+(?:-\d+)?)*)$").unwrap();
        let cap = format_re.captures(spec.trim())?;
        let word = match &cap[1] {
            "config" => ConfigWord::Config,
            "config1" => ConfigWord::Config1,
            _ => ConfigWord::Config2,
        };
        let mut bits = Vec::new();
        for range in cap[2].split(',') {
            let (lo, hi) = match range.split_once('-') {
                Some((lo, hi)) => (lo.parse().ok()?, hi.parse().ok()?),
                None => {
                    let bit = range.parse().ok()?;
                    (bit, bit)
                }
            };
            if lo > hi || hi > 63 {
                return None;
            }
            bits.push(lo..=hi);
        }
        Some(FormatField { word, bits })
    }

    /// Scatter `value` into the field's bit ranges, low bits first.
    pub fn apply(&self, value: u64, attr: &mut EventAttr) -> std::result::Result<(), String> {
        let mut remaining = value;
        let slot = self.word.slot(attr);
        for range in &self.bits {
            let width = range.end() - range.start() + 1;
            let mask = if width == 64 {
                u64::MAX
            } else {
                (1u64 << width) - 1
            };
            *slot &= !(mask << range.start());
            *slot |= (remaining & mask) << range.start();
            remaining = if width == 64 { 0 } else { remaining >> width };
        }
        if remaining != 0 {
            return Err(format!("value {value:#x} does not fit the field"));
        }
        Ok(())
    }
}

/// A performance monitoring unit exposed by the kernel.
#[derive(Debug, Clone, Default)]
pub struct Pmu {
    pub name: String,
    pub type_id: u32,
    pub cpus: Option<Vec<u32>>,
    formats: HashMap<String, FormatField>,
    aliases: HashMap<String, String>,
}

/// Terms that only make sense for sampling and are ignored when counting.
const SAMPLING_TERMS: &[&str] = &["period", "freq"];

impl Pmu {
    pub fn new(name: &str, type_id: u32) -> Self {
        Pmu {
            name: name.to_string(),
            type_id,
            ..Default::default()
        }
    }

    pub fn add_format(&mut self, term: &str, spec: &str) -> bool {
        match FormatField::parse(spec) {
            Some(field) => {
                self.formats.insert(term.to_string(), field);
                true
            }
            None => false,
        }
    }

    pub fn add_alias(&mut self, name: &str, terms: &str) {
        self.aliases.insert(name.to_string(), terms.trim().to_string());
    }

    pub fn has_alias(&self, name: &str) -> bool {
        self.aliases.contains_key(name)
    }

    /// Encode a term list such as `event=0x3c,umask=0x1,name=foo`.
    ///
    /// Returns the attribute and the value of a `name=` term, if present.
    pub fn encode(&self, terms: &str) -> std::result::Result<(EventAttr, Option<String>), String> {
        let mut attr = EventAttr::new(self.type_id, 0);
        let mut alias = None;
        self.encode_into(terms, &mut attr, &mut alias, true)?;
        Ok((attr, alias))
    }

    fn encode_into(
        &self,
        terms: &str,
        attr: &mut EventAttr,
        alias: &mut Option<String>,
        allow_aliases: bool,
    ) -> std::result::Result<(), String> {
        for term in terms.split(',').map(str::trim) {
            if term.is_empty() {
                return Err("empty term".to_string());
            }
            let (key, value) = match term.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (term, None),
            };
            if key == "name" {
                match value {
                    Some(value) if !value.is_empty() => *alias = Some(value.to_string()),
                    _ => return Err("name= needs a value".to_string()),
                }
                continue;
            }
            if SAMPLING_TERMS.contains(&key) {
                continue;
            }
            let number = match value {
                Some(value) => {
                    parse_number(value).ok_or_else(|| format!("bad value in term '{term}'"))?
                }
                None => {
                    if allow_aliases && !self.formats.contains_key(key) {
                        if let Some(expansion) = self.aliases.get(key) {
                            self.encode_into(expansion, attr, alias, false)?;
                            continue;
                        }
                    }
                    1
                }
            };
            match key {
                "config" => attr.config = number,
                "config1" => attr.config1 = number,
                "config2" => attr.config2 = number,
                _ => match self.formats.get(key) {
                    Some(field) => field
                        .apply(number, attr)
                        .map_err(|e| format!("term '{key}': {e}"))?,
                    None => return Err(format!("unknown term '{key}' for pmu {}", self.name)),
                },
            }
        }
        Ok(())
    }

    /// Resolve one of this PMU's event aliases.
    pub fn resolve_alias(&self, name: &str) -> Option<ResolvedEvent> {
        let terms = self.aliases.get(name)?;
        let mut attr = EventAttr::new(self.type_id, 0);
        let mut alias = None;
        if let Err(e) = self.encode_into(terms, &mut attr, &mut alias, false) {
            tracing::debug!("pmu {} alias {} not usable: {}", self.name, name, e);
            return None;
        }
        Some(ResolvedEvent {
            name: name.to_string(),
            attr,
            cpus: self.cpus.clone(),
        })
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::io(path, e))
}

fn visit_entries(dir: &Path, mut visit: impl FnMut(&str, &Path) -> Result<()>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let filename = filename.to_string();
        visit(&filename, &path)?;
    }
    Ok(())
}

fn visit_pmu(name: &str, dir: &Path) -> Result<Option<Pmu>> {
    let type_path = dir.join("type");
    if !type_path.exists() {
        return Ok(None);
    }
    let type_id = read_trimmed(&type_path)?
        .parse()
        .map_err(|_| Error::io(&type_path, std::io::ErrorKind::InvalidData.into()))?;
    let mut pmu = Pmu::new(name, type_id);

    for cpus_file in ["cpus", "cpumask"] {
        let path = dir.join(cpus_file);
        if path.exists() {
            let list = read_trimmed(&path)?;
            if !list.is_empty() {
                pmu.cpus = Some(parse_cpu_list(&list)?);
            }
            break;
        }
    }

    visit_entries(&dir.join("format"), |term, path| {
        let spec = read_trimmed(path)?;
        if !pmu.add_format(term, &spec) {
            tracing::debug!("pmu {}: ignoring format {} = {}", name, term, spec);
        }
        Ok(())
    })?;

    // Skip the .scale/.unit/.per-pkg companion files
    visit_entries(&dir.join("events"), |event, path| {
        if !event.contains('.') {
            let terms = read_trimmed(path)?;
            pmu.add_alias(event, &terms);
        }
        Ok(())
    })?;

    Ok(Some(pmu))
}

/// Walk a sysfs `event_source/devices` directory.
pub fn discover_pmus(root: &Path) -> Result<Vec<Pmu>> {
    let mut pmus = Vec::new();
    visit_entries(root, |name, path| {
        if let Some(pmu) = visit_pmu(name, path)? {
            pmus.push(pmu);
        }
        Ok(())
    })?;
    // "cpu" is the core PMU on non-hybrid systems, prefer it for aliases
    pmus.sort_by(|a, b| (a.name != "cpu", &a.name).cmp(&(b.name != "cpu", &b.name)));
    Ok(pmus)
}

fn number<'de, D>(de: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(de)?;
    match value {
        serde_json::Value::Null => Ok(0),
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("bad number {n}"))),
        // Offcore events list two codes, the first one is the event slot
        serde_json::Value::String(s) => {
            let first = s.split(',').next().unwrap_or_default();
            parse_number(first)
                .ok_or_else(|| serde::de::Error::custom(format!("bad number '{s}'")))
        }
        other => Err(serde::de::Error::custom(format!("bad number {other}"))),
    }
}

/// One entry of a perfmon JSON event list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonEvent {
    #[serde(rename = "EventName")]
    pub name: String,
    #[serde(rename = "EventCode", deserialize_with = "number")]
    pub event_code: u64,
    #[serde(rename = "UMask", deserialize_with = "number")]
    pub umask: u64,
    #[serde(rename = "CounterMask", deserialize_with = "number")]
    pub cmask: u64,
    #[serde(rename = "Invert", deserialize_with = "number")]
    pub invert: u64,
    #[serde(rename = "EdgeDetect", deserialize_with = "number")]
    pub edge: u64,
    #[serde(rename = "MSRValue", deserialize_with = "number")]
    pub msr_value: u64,
    #[serde(rename = "BriefDescription")]
    pub desc: Option<String>,
}

impl JsonEvent {
    /// Raw core PMU encoding. Event select bits 8-11 go to config bits 32-35.
    pub fn attr(&self) -> EventAttr {
        let config = (self.event_code & 0xff)
            | ((self.umask & 0xff) << 8)
            | ((self.edge & 1) << 18)
            | ((self.invert & 1) << 23)
            | ((self.cmask & 0xff) << 24)
            | (((self.event_code >> 8) & 0xf) << 32);
        EventAttr {
            config1: self.msr_value,
            ..EventAttr::new(PERF_TYPE_RAW, config)
        }
    }
}

/// A perfmon JSON event list, keyed by lower-cased event name.
#[derive(Debug, Default)]
pub struct JsonEvents {
    events: HashMap<String, JsonEvent>,
}

impl JsonEvents {
    pub fn parse(content: &str) -> serde_json::Result<Self> {
        let list: Vec<JsonEvent> = serde_json::from_str(content)?;
        let events = list
            .into_iter()
            .filter(|e| !e.name.is_empty())
            .map(|e| (e.name.to_lowercase(), e))
            .collect();
        Ok(JsonEvents { events })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        JsonEvents::parse(&content).map_err(|e| {
            Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    pub fn get(&self, name: &str) -> Option<&JsonEvent> {
        self.events.get(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The event database used by the command line tool.
#[derive(Debug, Default)]
pub struct EventResolver {
    pmus: Vec<Pmu>,
    json: Option<JsonEvents>,
}

impl EventResolver {
    /// A resolver that only knows the generic events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover the PMUs of the running system. A missing or unreadable
    /// sysfs tree leaves only the generic events available.
    pub fn from_system() -> Self {
        let root = Path::new(SYSFS_PMU_DIR);
        let pmus = match discover_pmus(root) {
            Ok(pmus) => pmus,
            Err(e) => {
                tracing::warn!("PMU discovery failed, only generic events available: {}", e);
                Vec::new()
            }
        };
        tracing::debug!("discovered {} PMUs", pmus.len());
        EventResolver { pmus, json: None }
    }

    pub fn with_pmu(mut self, pmu: Pmu) -> Self {
        self.pmus.push(pmu);
        self
    }

    pub fn with_json(mut self, json: JsonEvents) -> Self {
        self.json = Some(json);
        self
    }

    /// Load the JSON list named by `path`, or by [`EVENTMAP_ENV`] when no
    /// path is given.
    pub fn load_event_map(self, path: Option<PathBuf>) -> Result<Self> {
        let path = match path.or_else(|| std::env::var_os(EVENTMAP_ENV).map(PathBuf::from)) {
            Some(path) => path,
            None => return Ok(self),
        };
        let json = JsonEvents::load(&path)?;
        tracing::debug!("loaded {} events from {}", json.len(), path.display());
        Ok(self.with_json(json))
    }
}

impl EventDatabase for EventResolver {
    fn lookup(&self, name: &str) -> Option<ResolvedEvent> {
        if let Some(attr) = builtin_event(name) {
            return Some(ResolvedEvent {
                name: name.to_string(),
                attr,
                cpus: None,
            });
        }
        if let Some(event) = self.pmus.iter().find_map(|pmu| pmu.resolve_alias(name)) {
            return Some(event);
        }
        let event = self.json.as_ref()?.get(name)?;
        Some(ResolvedEvent {
            name: event.name.clone(),
            attr: event.attr(),
            cpus: None,
        })
    }

    fn pmu(&self, name: &str) -> Option<&Pmu> {
        self.pmus.iter().find(|pmu| pmu.name == name)
    }
}
