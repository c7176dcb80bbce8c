//! Event specification parsing.
//!
//! A specification is a comma separated list of events. A run of events
//! enclosed in braces forms one group, which the kernel schedules onto the
//! PMU as a unit:
//!
//! ```text
//! instructions,cpu-cycles,{cache-misses,cache-references}
//! ```
//!
//! Each event is one of
//!
//! - a symbolic name known to the [`EventDatabase`],
//! - `rHEX`, a raw config for the core PMU,
//! - `pmu/term=value,.../`, encoded through the PMU's sysfs format files,
//!
//! optionally followed by `:mods` (or directly by mods after the closing
//! slash of the PMU syntax): `u` user, `k` kernel, `h` hypervisor, `p` one
//! step of precise IP.

use crate::error::{Error, Result};
use crate::perf::{EventAttr, PERF_TYPE_RAW};
use crate::pmu::EventDatabase;

/// Highest `precise_ip` level the kernel accepts.
const MAX_PRECISE: u8 = 3;

/// One event of a parsed specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDefinition {
    /// The token as it appeared in the specification.
    pub token: String,
    /// Canonical name of the resolved event.
    pub name: String,
    /// Display name from a `name=` term.
    pub alias: Option<String>,
    pub attr: EventAttr,
    /// CPUs the event's PMU counts on, `None` for every CPU.
    pub cpus: Option<Vec<u32>>,
}

impl EventDefinition {
    /// The name to print for this event.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Events that share one kernel counter group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    events: Vec<EventDefinition>,
    /// Written with braces, as opposed to a lone event.
    braced: bool,
}

impl Group {
    pub fn events(&self) -> &[EventDefinition] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_braced(&self) -> bool {
        self.braced
    }

    pub fn leader(&self) -> &EventDefinition {
        &self.events[0]
    }
}

/// Split a specification into groups of raw tokens.
fn split_groups(spec: &str) -> Result<Vec<(Vec<String>, bool)>> {
    let mut groups = Vec::new();
    let mut current: Option<Vec<String>> = None;
    let mut token = String::new();
    // Commas between the slashes of pmu/.../ belong to the token
    let mut in_terms = false;
    // A token was just closed by '}' and must be followed by ',' or the end
    let mut after_brace = false;

    fn finish(
        token: &mut String,
        current: &mut Option<Vec<String>>,
        groups: &mut Vec<(Vec<String>, bool)>,
    ) -> Result<()> {
        let text = token.trim().to_string();
        token.clear();
        if text.is_empty() {
            return Err(Error::spec(&text, "empty event"));
        }
        match current {
            Some(members) => members.push(text),
            None => groups.push((vec![text], false)),
        }
        Ok(())
    }

    for c in spec.chars() {
        if after_brace {
            match c {
                ',' => {
                    after_brace = false;
                    continue;
                }
                c if c.is_whitespace() => continue,
                _ => return Err(Error::spec(spec, "expected ',' after '}'")),
            }
        }
        match c {
            '/' => {
                in_terms = !in_terms;
                token.push(c);
            }
            _ if in_terms => token.push(c),
            '{' => {
                if current.is_some() {
                    return Err(Error::spec(spec, "nested '{'"));
                }
                if !token.trim().is_empty() {
                    return Err(Error::spec(token.trim(), "unexpected '{'"));
                }
                token.clear();
                current = Some(Vec::new());
            }
            '}' => {
                let Some(mut members) = current.take() else {
                    return Err(Error::spec(spec, "unmatched '}'"));
                };
                let mut inner = Some(Vec::new());
                finish(&mut token, &mut inner, &mut groups)?;
                members.extend(inner.unwrap_or_default());
                groups.push((members, true));
                after_brace = true;
            }
            ',' => finish(&mut token, &mut current, &mut groups)?,
            _ => token.push(c),
        }
    }

    if in_terms {
        return Err(Error::spec(token.trim(), "unterminated '/'"));
    }
    if current.is_some() {
        return Err(Error::spec(spec, "unmatched '{'"));
    }
    if !after_brace {
        finish(&mut token, &mut current, &mut groups)?;
    }
    Ok(groups)
}

/// Apply a modifier string such as `uk` or `upp`.
fn apply_modifiers(token: &str, mods: &str, attr: &mut EventAttr) -> Result<()> {
    let mut user = false;
    let mut kernel = false;
    let mut hv = false;
    let mut precise = 0u8;
    for m in mods.chars() {
        match m {
            'u' => user = true,
            'k' => kernel = true,
            'h' => hv = true,
            'p' if precise == MAX_PRECISE => {
                return Err(Error::spec(token, "too many 'p' modifiers"))
            }
            'p' => precise += 1,
            _ => return Err(Error::spec(token, format!("unknown modifier '{m}'"))),
        }
    }
    if user || kernel || hv {
        attr.exclude_user = !user;
        attr.exclude_kernel = !kernel;
        attr.exclude_hv = !hv;
    }
    attr.precise_ip = precise;
    Ok(())
}

fn parse_raw(body: &str) -> Option<u64> {
    let hex = body.strip_prefix('r')?;
    if hex.is_empty() {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Resolve a single token against the database.
pub fn resolve_token(token: &str, db: &dyn EventDatabase) -> Result<EventDefinition> {
    let token = token.trim();

    // pmu/terms/[mods]
    if let Some((pmu_name, rest)) = token.split_once('/') {
        let Some((terms, mods)) = rest.rsplit_once('/') else {
            return Err(Error::spec(token, "unterminated '/'"));
        };
        let mods = mods.strip_prefix(':').unwrap_or(mods);
        let pmu = db
            .pmu(pmu_name)
            .ok_or_else(|| Error::spec(token, format!("unknown pmu '{pmu_name}'")))?;
        let (mut attr, alias) = pmu.encode(terms).map_err(|e| Error::spec(token, e))?;
        apply_modifiers(token, mods, &mut attr)?;
        return Ok(EventDefinition {
            token: token.to_string(),
            name: token.to_string(),
            alias,
            attr,
            cpus: pmu.cpus.clone(),
        });
    }

    // Symbolic names may themselves contain ':' (e.g. some uncore aliases),
    // so try the full token before splitting off modifiers.
    if let Some(event) = db.lookup(token) {
        return Ok(EventDefinition {
            token: token.to_string(),
            name: event.name,
            alias: None,
            attr: event.attr,
            cpus: event.cpus,
        });
    }

    let (body, mods) = token.rsplit_once(':').unwrap_or((token, ""));
    let (name, mut attr, cpus) = if let Some(event) = db.lookup(body) {
        (event.name, event.attr, event.cpus)
    } else if let Some(config) = parse_raw(body) {
        (body.to_string(), EventAttr::new(PERF_TYPE_RAW, config), None)
    } else {
        return Err(Error::spec(token, "unknown event"));
    };
    apply_modifiers(token, mods, &mut attr)?;
    let name = if mods.is_empty() {
        name
    } else {
        format!("{name}:{mods}")
    };
    Ok(EventDefinition {
        token: token.to_string(),
        name,
        alias: None,
        attr,
        cpus,
    })
}

/// Parse a full specification into groups.
///
/// Nothing is returned unless every token resolves.
pub fn parse_events(spec: &str, db: &dyn EventDatabase) -> Result<Vec<Group>> {
    split_groups(spec)?
        .into_iter()
        .map(|(tokens, braced)| {
            if tokens.is_empty() {
                return Err(Error::spec("{}", "empty group"));
            }
            let events = tokens
                .iter()
                .map(|token| resolve_token(token, db))
                .collect::<Result<Vec<_>>>()?;
            Ok(Group { events, braced })
        })
        .collect()
}

/// Render groups back into specification text, using each event's token as
/// written.
pub fn format_groups(groups: &[Group]) -> String {
    groups
        .iter()
        .map(|group| {
            let names = group
                .events
                .iter()
                .map(|e| e.token.as_str())
                .collect::<Vec<_>>()
                .join(",");
            if group.braced {
                format!("{{{names}}}")
            } else {
                names
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
