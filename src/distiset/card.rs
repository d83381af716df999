//! Dataset card rendering.

use crate::distiset::{CONFIGS_DIR, Distiset, PIPELINE_CONFIG_FILE};
use std::fmt::Write as _;

/// Tags written into every card.
pub const CARD_TAGS: [&str; 3] = ["synthetic", "prefclean", "rlaif"];

/// Hugging Face `size_categories` bucket for a row count.
pub fn size_category(rows: usize) -> &'static str {
    match rows {
        n if n < 1_000 => "n<1K",
        n if n < 10_000 => "1K<n<10K",
        n if n < 100_000 => "10K<n<100K",
        n if n < 1_000_000 => "100K<n<1M",
        n if n < 10_000_000 => "1M<n<10M",
        n if n < 100_000_000 => "10M<n<100M",
        n if n < 1_000_000_000 => "100M<n<1B",
        _ => "n>1B",
    }
}

/// Render a README with YAML metadata and a subset table.
///
/// The size category follows the largest dataset.
pub fn render_card(distiset: &Distiset, with_config: bool) -> String {
    let largest = distiset
        .iter()
        .map(|(_, entry)| entry.num_rows())
        .max()
        .unwrap_or(0);

    let mut card = String::from("---\n");
    let _ = writeln!(card, "size_categories: {}", size_category(largest));
    card.push_str("tags:\n");
    for tag in CARD_TAGS {
        let _ = writeln!(card, "- {tag}");
    }
    card.push_str("---\n\n");

    card.push_str("# Dataset Card\n\n");
    card.push_str(
        "Preference pairs cleaned with prefclean: each pair's responses are shuffled, \
         rated by a judge model and pruned to the training columns.\n\n",
    );

    card.push_str("## Subsets\n\n| Subset | Split | Rows |\n|---|---|---|\n");
    for (name, entry) in distiset.iter() {
        for (split, rows) in entry.split_rows() {
            let _ = writeln!(card, "| {name} | {split} | {rows} |");
        }
    }

    if with_config && distiset.pipeline_config().is_some() {
        let _ = write!(
            card,
            "\n## Reproducing\n\nThe run configuration is stored in \
             `{CONFIGS_DIR}/{PIPELINE_CONFIG_FILE}`:\n\n```bash\n\
             prefclean run --config {CONFIGS_DIR}/{PIPELINE_CONFIG_FILE}\n```\n"
        );
    }
    card
}
