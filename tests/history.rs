use ppgquest::challenge::{ChallengeConfig, ChallengeResults, ChallengeStateMachine};
use ppgquest::history::{HistoryDb, HistoryEntry};

fn finished_run(level: f64) -> (ChallengeResults, ChallengeConfig) {
    let config = ChallengeConfig::default();
    let mut machine = ChallengeStateMachine::new(config);
    machine.start_game();
    for i in 0..=400u32 {
        let t = i as f64 * 0.1;
        let v = if t < 10.0 { 100.0 } else { level };
        machine.process_data_point(t, v);
    }
    (machine.get_final_results().unwrap(), config)
}

#[test]
fn history_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("history.db");

    {
        let db = HistoryDb::open(&path).unwrap();
        let (results, config) = finished_run(200.0);
        db.record(&results, &config).unwrap();
    }

    let db = HistoryDb::open(&path).unwrap();
    let entries = db.recent(5).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].percent_in_target, 100.0);
    assert_eq!(entries[0].baseline, 100.0);
}

#[test]
fn best_run_wins_over_recent_ones() {
    let dir = tempfile::tempdir().unwrap();
    let db = HistoryDb::open(dir.path().join("history.db")).unwrap();

    for level in [120.0, 200.0, 90.0] {
        let (results, config) = finished_run(level);
        db.record(&results, &config).unwrap();
    }

    let best = db.best().unwrap().unwrap();
    assert_eq!(best.percent_in_target, 100.0);
    assert_eq!(db.count().unwrap(), 3);
}

#[test]
fn export_csv_writes_header_and_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db = HistoryDb::open(dir.path().join("history.db")).unwrap();
    let (results, config) = finished_run(200.0);
    db.record(&results, &config).unwrap();
    db.record(&results, &config).unwrap();

    let out = dir.path().join("export.csv");
    assert_eq!(db.export_csv(&out).unwrap(), 2);

    let mut reader = csv::Reader::from_path(&out).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(&headers[0], "id");
    assert!(headers.iter().any(|h| h == "percent_in_target"));

    let rows: Vec<HistoryEntry> = reader.deserialize().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].id < rows[1].id);
    assert_eq!(rows[0].score, results.score);
}

#[test]
fn export_of_empty_history_creates_file() {
    let dir = tempfile::tempdir().unwrap();
    let db = HistoryDb::open(dir.path().join("history.db")).unwrap();
    let out = dir.path().join("empty.csv");
    assert_eq!(db.export_csv(&out).unwrap(), 0);
    assert!(out.exists());
}
