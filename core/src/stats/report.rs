use super::registry::{CounterRegistry, DEFAULT_SECTION};

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::thread;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use csv::Writer;
use prettytable::{format, Cell, Row, Table};
use serde::Serialize;

/// Aggregated value of one configured counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterValue {
    pub index: usize,
    pub string_id: String,
    pub title: String,
    pub section: String,
    pub value: u64,
    pub write_to_file: bool,
    pub write_to_db: bool,
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    section: &'a str,
    counter: &'a str,
    title: &'a str,
    value: u64,
}

impl CounterRegistry {
    /// Aggregated values of all configured counters, grouped by section. The default section
    /// comes first, the others follow in name order.
    pub fn snapshot(&self) -> Vec<CounterValue> {
        let configured: Vec<_> = {
            let meta = self.metadata();
            let default = meta.sections.get(DEFAULT_SECTION).into_iter();
            let named = meta
                .sections
                .iter()
                .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
                .map(|(_, indices)| indices);
            default
                .chain(named)
                .flatten()
                .filter_map(|index| meta.entries.get(*index).cloned().flatten())
                .collect()
        };
        configured
            .into_iter()
            .map(|spec| CounterValue {
                value: self.get_aggregate(spec.index),
                index: spec.index,
                string_id: spec.string_id,
                title: spec.title,
                section: spec.section,
                write_to_file: spec.write_to_file,
                write_to_db: spec.write_to_db,
            })
            .collect()
    }

    /// Renders all configured counters as a text table, one block of rows per section. The
    /// default section comes without a header row.
    pub fn render_table(&self) -> String {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
        table.set_titles(Row::new(vec![Cell::new("counter"), Cell::new("value")]));

        let values = self.snapshot();
        let mut section = None;
        for value in values.iter() {
            if section != Some(value.section.as_str()) {
                section = Some(value.section.as_str());
                if value.section != DEFAULT_SECTION {
                    table.add_row(Row::new(vec![
                        Cell::new(&value.section).style_spec("bH2")
                    ]));
                }
            }
            table.add_row(Row::new(vec![
                Cell::new(&value.title),
                Cell::new(&value.value.to_string()).style_spec("r"),
            ]));
        }
        table.to_string()
    }

    /// Writes one CSV row per counter marked `write_to_file`.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut wtr = Writer::from_writer(writer);
        for value in self.snapshot().iter().filter(|v| v.write_to_file) {
            wtr.serialize(CsvRow {
                section: &value.section,
                counter: &value.string_id,
                title: &value.title,
                value: value.value,
            })?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn dump_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        self.write_csv(file)
    }

    pub fn dump_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(&file, &self.snapshot())?;
        Ok(())
    }

    /// One upsert per counter marked `write_to_db`, stamped with `timestamp` and the calling
    /// thread's name.
    pub fn to_db_statements<Tz>(&self, timestamp: &DateTime<Tz>) -> Vec<String>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let identity = self.identity();
        let current = thread::current();
        let thread = current.name().unwrap_or("main");
        let stamp = timestamp.format("%Y-%m-%d %H:%M:%S").to_string();

        self.snapshot()
            .into_iter()
            .filter(|v| v.write_to_db)
            .map(|v| {
                format!(
                    "INSERT INTO counters (host, application, module, thread, counter, value, \
                     updated_at) VALUES ('{}', '{}', '{}', '{}', '{}', {}, '{}') \
                     ON DUPLICATE KEY UPDATE value = VALUES(value), updated_at = VALUES(updated_at);",
                    escape(&identity.host),
                    escape(&identity.application),
                    escape(&identity.module),
                    escape(thread),
                    escape(&v.string_id),
                    v.value,
                    stamp,
                )
            })
            .collect()
    }
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}: {}", self.section, self.string_id, self.value)
    }
}

/// SQL string literal escaping.
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{CounterSpec, ReportIdentity};

    use chrono::Utc;

    fn configured() -> CounterRegistry {
        let registry = CounterRegistry::new(8, ReportIdentity::new("probe-01", "gtp", "tick'ets"));
        registry
            .configure(CounterSpec::new(0, "pdus", "PDUs received").write_to_db(true))
            .unwrap();
        registry
            .configure(CounterSpec::new(1, "tickets", "Tickets closed").section("tickets"))
            .unwrap();
        registry
            .configure(
                CounterSpec::new(2, "errors", "Ticket errors")
                    .section("tickets")
                    .write_to_file(false)
                    .write_to_db(true),
            )
            .unwrap();
        registry.inc(0, 10);
        registry.inc(1, 4);
        registry.inc(2, 1);
        registry
    }

    #[test]
    fn snapshot_groups_by_section() {
        let registry = configured();
        let ids: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|v| (v.string_id, v.value))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("pdus".to_owned(), 10),
                ("tickets".to_owned(), 4),
                ("errors".to_owned(), 1)
            ]
        );
    }

    #[test]
    fn table_suppresses_default_header() {
        let table = configured().render_table();
        assert!(table.contains("PDUs received"));
        assert!(table.contains("Tickets closed"));
        assert!(table.contains("tickets"));
        assert!(!table.contains(DEFAULT_SECTION));
    }

    #[test]
    fn default_section_rows_precede_named_sections() {
        let registry = configured();
        registry
            .configure(CounterSpec::new(3, "alarms", "Alarms raised").section("alarms"))
            .unwrap();

        let sections: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|v| v.section)
            .collect();
        assert_eq!(sections, vec!["default", "alarms", "tickets", "tickets"]);

        let table = registry.render_table();
        let pdus = table.find("PDUs received").unwrap();
        let alarms_header = table.find("alarms").unwrap();
        let alarms_row = table.find("Alarms raised").unwrap();
        assert!(pdus < alarms_header);
        assert!(alarms_header < alarms_row);
    }

    #[test]
    fn csv_skips_counters_not_written_to_file() {
        let mut out = Vec::new();
        configured().write_csv(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "section,counter,title,value");
        assert_eq!(lines[1], "default,pdus,PDUs received,10");
        assert_eq!(lines[2], "tickets,tickets,Tickets closed,4");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn db_statements_are_escaped() {
        let registry = configured();
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let statements = thread::Builder::new()
            .name("reporter".to_owned())
            .spawn(move || registry.to_db_statements(&timestamp))
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("'probe-01', 'gtp', 'tick''ets', 'reporter', 'pdus', 10"));
        assert!(statements[0].contains("'2024-03-01 12:30:00'"));
        assert!(statements[1].contains("'errors', 1"));
    }
}
