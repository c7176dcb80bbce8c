//! Plain-text counter report.

use std::io::{self, Write};
use std::time::Duration;

use crate::backend::CounterBackend;
use crate::event_list::{EventList, Target};

/// Format a count with comma digit grouping, `1234567` -> `1,234,567`.
pub fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn write_timestamp(w: &mut impl Write, ts: Option<Duration>) -> io::Result<()> {
    match ts {
        Some(ts) => write!(w, "{:08.4}\t", ts.as_secs_f64()),
        None => Ok(()),
    }
}

fn cpu_label(target: &Target) -> String {
    match target.cpu() {
        Some(cpu) => cpu.to_string(),
        None => "-".to_string(),
    }
}

/// One line per event with the sum over all targets.
pub fn print_aggregate<B: CounterBackend>(
    w: &mut impl Write,
    list: &EventList<B>,
    ts: Option<Duration>,
) -> io::Result<()> {
    for (id, event) in list.events() {
        write_timestamp(w, ts)?;
        writeln!(
            w,
            "{:<30} {:>15}",
            event.display_name(),
            format_count(list.aggregate(id))
        )?;
    }
    Ok(())
}

/// One line per event per target that has a value.
pub fn print_per_target<B: CounterBackend>(
    w: &mut impl Write,
    list: &EventList<B>,
    ts: Option<Duration>,
) -> io::Result<()> {
    for (id, event) in list.events() {
        for (_, target, value) in list.values(id).filter(|(_, _, v)| v.valid) {
            write_timestamp(w, ts)?;
            writeln!(
                w,
                "{:>3} {:<30} {:>15}",
                cpu_label(&target),
                event.display_name(),
                format_count(value.scaled_count)
            )?;
        }
    }
    Ok(())
}

pub fn print_values<B: CounterBackend>(
    w: &mut impl Write,
    list: &EventList<B>,
    ts: Option<Duration>,
    no_aggr: bool,
) -> io::Result<()> {
    if no_aggr {
        print_per_target(w, list, ts)?;
    } else {
        print_aggregate(w, list, ts)?;
    }
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::event_list::TargetSpec;
    use crate::perf::*;
    use crate::pmu::EventResolver;

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(123456), "123,456");
        assert_eq!(format_count(1234567), "1,234,567");
        assert_eq!(format_count(u64::MAX), "18,446,744,073,709,551,615");
    }

    fn measured() -> EventList<FakeBackend> {
        let mut list = EventList::with_backend(FakeBackend::default());
        list.parse_events(
            "instructions,cpu/event=0x3c,name=unhalted/",
            &EventResolver::new().with_pmu({
                let mut pmu = crate::pmu::Pmu::new("cpu", 4);
                pmu.add_format("event", "config:0-7");
                pmu
            }),
        )
        .unwrap();
        list.setup_events_on(&TargetSpec::all_cpus().with_cpus(vec![0, 2]), &[0, 1, 2], &[0, 1, 2])
            .unwrap();
        let backend = list.backend_mut();
        backend.counts.insert((PERF_COUNT_HW_INSTRUCTIONS, 0), 1_000_000);
        backend.counts.insert((PERF_COUNT_HW_INSTRUCTIONS, 2), 234_567);
        backend.counts.insert((0x3c, 0), 42);
        list.read_all_events();
        list
    }

    #[test]
    fn test_aggregate_lines() {
        let list = measured();
        let mut out = Vec::new();
        print_values(&mut out, &list, None, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        let expected = format!(
            "{:<30} {:>15}\n{:<30} {:>15}\n",
            "instructions", "1,234,567", "unhalted", "42"
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_per_target_skips_masked_cpus() {
        let list = measured();
        let mut out = Vec::new();
        print_values(&mut out, &list, None, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], format!("  0 {:<30} {:>15}", "instructions", "1,000,000"));
        assert_eq!(lines[1], format!("  2 {:<30} {:>15}", "instructions", "234,567"));
        assert!(lines.iter().all(|l| !l.starts_with("  1 ")));
    }

    #[test]
    fn test_interval_timestamp_prefix() {
        let list = measured();
        let mut out = Vec::new();
        print_values(&mut out, &list, Some(Duration::from_millis(1500)), false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().all(|l| l.starts_with("001.5000\t")));
    }
}
