//! End-to-end run of the cleaning pipeline against an in-memory judge.

use async_trait::async_trait;
use prefclean::client::{CompletionResponse, Message};
use prefclean::models::ModelSpec;
use prefclean::{
    CleaningPipeline, Config, DatasetEntry, Distiset, Record, Result, SaveOptions, TextGenerator,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Rates a text 5 when it names the right capital, 1 otherwise.
struct CapitalJudge {
    calls: AtomicUsize,
}

#[async_trait]
impl TextGenerator for CapitalJudge {
    async fn generate(&self, model: &ModelSpec, messages: &[Message]) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let user = &messages[1].content;
        let mut content = String::new();
        for (i, line) in user
            .lines()
            .filter(|l| l.starts_with("<text ") && !l.contains("[Text"))
            .enumerate()
        {
            let rating = if line.contains("Madrid") || line.contains("Paris") { 5 } else { 1 };
            content.push_str(&format!(
                "#### Output for Text {}\nRating: {rating}\nRationale: Judged line {}.\n\n",
                i + 1,
                i + 1
            ));
        }
        Ok(CompletionResponse {
            content,
            model: model.id.clone(),
            input_tokens: 50,
            output_tokens: 30,
            total_tokens: 80,
            cost_usd: 0.0,
            duration: Duration::from_millis(1),
        })
    }
}

fn write_inputs(dir: &TempDir) -> std::path::PathBuf {
    let rows = [
        json!({"system": "", "question": "What is the capital of Spain?", "chosen": "Madrid", "rejected": "Barcelona"}),
        json!({"system": "", "question": "What is the capital of France?", "chosen": "Paris", "rejected": "Lyon"}),
        json!({"system": "Be brief.", "question": "Capital of Spain, one word.", "chosen": "Madrid", "rejected": "Seville"}),
    ];
    let path = dir.path().join("pairs.jsonl");
    let body: String = rows.iter().map(|r| format!("{r}\n")).collect();
    std::fs::write(&path, body).unwrap();
    path
}

fn write_config(dir: &TempDir, input: &std::path::Path) -> Config {
    let config = format!(
        r#"
[loader]
path = "{input}"
batch_size = 2
seed = 42

[scorer]
concurrency = 2

[scorer.model]
id = "meta-llama/Meta-Llama-3.1-70B-Instruct"

[output]
path = "{output}"
distiset_dir = "{distiset}"
"#,
        input = input.display(),
        output = dir.path().join("clean.jsonl").display(),
        distiset = dir.path().join("distiset").display(),
    );
    let path = dir.path().join("config.toml");
    std::fs::write(&path, config).unwrap();
    Config::from_file(&path).unwrap()
}

fn single(distiset: &Distiset) -> &[Record] {
    match distiset.get("keep_columns") {
        Some(DatasetEntry::Single(records)) => records,
        other => panic!("unexpected entry: {other:?}"),
    }
}

#[tokio::test]
async fn test_full_run_shuffles_rates_and_prunes() {
    let dir = TempDir::new().unwrap();
    let input = write_inputs(&dir);
    let config = write_config(&dir, &input);

    let judge = Arc::new(CapitalJudge {
        calls: AtomicUsize::new(0),
    });
    let pipeline = CleaningPipeline::from_config(&config, judge.clone())
        .unwrap()
        .with_progress(false);
    let source = CleaningPipeline::load_source(&config).unwrap();

    let out = pipeline.run(source, &config.output.path).await.unwrap();
    assert_eq!(judge.calls.load(Ordering::Relaxed), 3);
    assert_eq!(out.stats.total_records, 3);
    assert_eq!(out.stats.total_batches, 2);
    assert_eq!(out.stats.total_scored, 3);
    assert_eq!(out.stats.total_written, 3);
    assert!((out.stats.scoring_success_rate - 1.0).abs() < f64::EPSILON);

    let records = single(&out.distiset);
    let instructions: Vec<_> = records
        .iter()
        .map(|r| r.get_str("instruction").unwrap())
        .collect();
    assert_eq!(
        instructions,
        vec![
            "What is the capital of Spain?",
            "What is the capital of France?",
            "Capital of Spain, one word."
        ]
    );

    for record in records {
        assert_eq!(
            record.keys().collect::<Vec<_>>(),
            vec!["instruction", "generations", "order", "ratings", "rationales", "model_name"]
        );
        assert_eq!(record.check_alignment(), Ok(Some(2)));

        // The chosen response always earns the 5, wherever the shuffle put it.
        let order = record.get_str_array("order").unwrap();
        let ratings = record.get("ratings").and_then(Value::as_array).unwrap();
        for (role, rating) in order.iter().zip(ratings) {
            let expected = if *role == "chosen" { 5 } else { 1 };
            assert_eq!(rating, &json!(expected), "{record:?}");
        }
    }

    let written = std::fs::read_to_string(&config.output.path).unwrap();
    let reread: Vec<Record> = written
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(reread, records);
}

#[tokio::test]
async fn test_distiset_round_trip_with_split() {
    let dir = TempDir::new().unwrap();
    let input = write_inputs(&dir);
    let config = write_config(&dir, &input);

    let pipeline = CleaningPipeline::from_config(
        &config,
        Arc::new(CapitalJudge {
            calls: AtomicUsize::new(0),
        }),
    )
    .unwrap()
    .with_progress(false);
    let source = CleaningPipeline::load_source(&config).unwrap();
    let out = pipeline.run(source, &config.output.path).await.unwrap();

    let distiset = out.distiset.train_test_split(0.67, Some(1)).unwrap();
    let distiset_dir = config.output.distiset_dir.clone().unwrap();
    distiset
        .save_to_disk(&distiset_dir, SaveOptions::default())
        .unwrap();

    let card = std::fs::read_to_string(distiset_dir.join("README.md")).unwrap();
    assert!(card.contains("size_categories: n<1K"));
    assert!(card.contains("- rlaif"));
    assert!(card.contains("| keep_columns | train | 2 |"));
    assert!(card.contains("| keep_columns | test | 1 |"));

    let saved_config = std::fs::read_to_string(distiset_dir.join("distiset_configs/pipeline.toml")).unwrap();
    assert!(saved_config.contains("[loader]"));

    let loaded = Distiset::load_from_disk(&distiset_dir).unwrap();
    assert_eq!(loaded.get("keep_columns"), distiset.get("keep_columns"));
    assert!(loaded.pipeline_config_path().is_some());
}
