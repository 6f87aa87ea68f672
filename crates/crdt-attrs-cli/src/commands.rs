use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use crdt_attrs::version::{self, PayloadKind};
use crdt_attrs::{Doc, Layout};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::BenchConfig;
use crate::workload;

type Result = std::result::Result<(), Box<dyn std::error::Error>>;

/// `crdt-attrs schema` — Compare layouts by size and timing.
pub fn schema(config: &BenchConfig) -> Result {
    println!(
        "Elements: {}, update rounds: {}, seed: {}",
        format_num(config.elements as u64),
        format_num(config.updates as u64),
        config.seed
    );
    println!();

    println!(
        "  {:<22} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "Layout", "Hydrate", "Encoded", "JSON", "Update", "Encoded", "JSON"
    );
    println!("  {}", "-".repeat(88));

    for &layout in &config.layouts {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut doc = Doc::open("bench");

        let start = Instant::now();
        let ids = workload::hydrate(&mut doc, layout, config.elements, &mut rng)?;
        let hydrate_time = start.elapsed();
        let hydrated = doc.encoded_len()?;
        let hydrated_json = json_len(&doc)?;

        let start = Instant::now();
        workload::update(&mut doc, &ids, config.updates, &mut rng)?;
        let update_time = start.elapsed();
        let updated = doc.encoded_len()?;
        let updated_json = json_len(&doc)?;
        tracing::debug!(%layout, elements = ids.len(), hydrated, updated, "benchmarked layout");

        println!(
            "  {:<22} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            layout.name(),
            format_duration(hydrate_time),
            format_bytes(hydrated),
            format_bytes(hydrated_json),
            format_duration(update_time),
            format_bytes(updated),
            format_bytes(updated_json),
        );
    }
    println!();

    Ok(())
}

/// `crdt-attrs replace` — Compact every attribute list and report the savings.
pub fn replace(config: &BenchConfig, output: Option<&Path>) -> Result {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut doc = Doc::open("bench");

    let start = Instant::now();
    let ids = workload::hydrate(&mut doc, Layout::KeyValueSequence, config.elements, &mut rng)?;
    println!(
        "Hydrated {} elements in {}",
        format_num(ids.len() as u64),
        format_duration(start.elapsed())
    );
    let hydrated = doc.encoded_len()?;

    let start = Instant::now();
    workload::update(&mut doc, &ids, config.updates, &mut rng)?;
    println!(
        "Applied {} update rounds in {}",
        format_num(config.updates as u64),
        format_duration(start.elapsed())
    );
    let updated = doc.encoded_len()?;
    let mut tombstones = 0;
    for id in &ids {
        tombstones += doc.tombstone_count(id)?;
    }

    let start = Instant::now();
    for id in &ids {
        doc.compact_replace(id)?;
    }
    let compact_time = start.elapsed();
    let compacted = doc.encoded_len()?;
    tracing::debug!(
        lists = ids.len(),
        before = updated,
        after = compacted,
        "replaced attribute lists"
    );

    println!();
    println!("  {:<20} {:>12} {:>12}", "Stage", "Encoded", "JSON");
    println!("  {}", "-".repeat(46));
    println!("  {:<20} {:>12} {:>12}", "hydrated", format_bytes(hydrated), "");
    println!("  {:<20} {:>12} {:>12}", "updated", format_bytes(updated), "");
    println!(
        "  {:<20} {:>12} {:>12}",
        "replaced",
        format_bytes(compacted),
        format_bytes(json_len(&doc)?)
    );
    println!("  {}", "-".repeat(46));
    println!(
        "Replaced {} lists in {}, dropping {} tombstones ({:.1}% of the updated size)",
        format_num(ids.len() as u64),
        format_duration(compact_time),
        format_num(tombstones as u64),
        percent(compacted, updated),
    );

    if let Some(path) = output {
        let update = doc.close()?;
        fs::write(path, &update)?;
        println!("Wrote {} to {}", format_bytes(update.len()), path.display());
    }

    Ok(())
}

/// `crdt-attrs inspect <file>` — Show what an exported update contains.
pub fn inspect(path: &Path, json: bool) -> Result {
    let data = fs::read(path)?;
    let header = version::peek(&data)?;
    if header.kind != PayloadKind::Document {
        let kind = header.kind;
        return Err(format!("{} holds a {kind:?} update, not a document", path.display()).into());
    }
    let doc = Doc::from_update("inspect", &data)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc.view())?);
        return Ok(());
    }

    println!("Update: {} ({})", path.display(), format_bytes(data.len()));
    println!(
        "Format: v{}, {} byte payload, clock at {}",
        header.version,
        format_num(header.payload_len as u64),
        doc.clock().counter()
    );
    println!(
        "Elements: {}, retired lists: {}",
        format_num(doc.len() as u64),
        format_num(doc.retired_count() as u64)
    );
    println!();

    if doc.is_empty() {
        println!("  (empty document)");
        return Ok(());
    }

    println!(
        "  {:<10} {:<22} {:>10}  {}",
        "Element", "Layout", "Tombstones", "Attributes"
    );
    println!("  {}", "-".repeat(70));
    for id in doc.element_ids() {
        let attributes = doc
            .attributes(id)?
            .iter()
            .map(|entry| format!("{}={}", entry.key, entry.value))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "  {:<10} {:<22} {:>10}  {}",
            truncate(id, 10),
            doc.layout(id)?.name(),
            format_num(doc.tombstone_count(id)? as u64),
            truncate(&attributes, 40)
        );
    }
    println!();

    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────

fn json_len(doc: &Doc) -> std::result::Result<usize, serde_json::Error> {
    Ok(serde_json::to_vec(&doc.view())?.len())
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}

fn format_duration(d: Duration) -> String {
    format!("{:.1} ms", d.as_secs_f64() * 1000.0)
}

fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 2] = ["KB", "MB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

/// Digits grouped in threes: `1234567` -> `1,234,567`.
fn format_num(n: u64) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_use_binary_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn numbers_get_thousands_separators() {
        assert_eq!(format_num(999), "999");
        assert_eq!(format_num(1000), "1,000");
        assert_eq!(format_num(123456), "123,456");
        assert_eq!(format_num(1234567), "1,234,567");
    }

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("width=1", 10), "width=1");
        assert_eq!(truncate("width=100, height=200", 10), "width=1...");
    }

    #[test]
    fn percent_of_empty_is_zero() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(25, 100), 25.0);
    }

    #[test]
    fn replace_output_can_be_inspected() {
        let dir = std::env::temp_dir().join(format!("crdt-attrs-cli-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("update.bin");

        let config = BenchConfig {
            elements: 3,
            updates: 2,
            ..BenchConfig::default()
        };
        replace(&config, Some(&path)).unwrap();
        inspect(&path, false).unwrap();
        inspect(&path, true).unwrap();

        let doc = Doc::from_update("check", &fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc.len(), 3);
        assert_eq!(doc.retired_count(), 3);

        fs::remove_dir_all(&dir).unwrap();
    }
}
