use markov_engine::codec::ChainDecoder;
use markov_engine::tokenizer::matches_token;
use markov_engine::{Engine, EngineConfig, Parent};
use std::fs::File;
use std::io::Read;
use zip::ZipArchive;

fn config(dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::with_storage_dir(dir.join("chains"));
    config.start_key = "<s>".to_string();
    config.end_key = "</s>".to_string();
    config
}

fn read_parents(engine: &Engine, chain: &str) -> Vec<Parent> {
    let path = engine.layout().chain_path(chain).unwrap();
    ChainDecoder::open(path).unwrap().collect::<Result<_, _>>().unwrap()
}

#[test]
fn test_defluff_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.defluff_threshold = 2;
    let engine = Engine::open(config).unwrap();
    for _ in 0..3 {
        engine.ingest("chan", "common words here");
    }
    engine.ingest("chan", "rare words there");
    engine.ingest("other", "only once");
    engine.write_cycle().unwrap();

    let outcome = engine.defluff();
    assert!(outcome.edges_removed > 0);

    let parents = read_parents(&engine, "chan");
    for parent in &parents {
        assert!(!parent.is_empty(), "{} has no edges", parent.word);
        for edge in parent.children.iter().chain(&parent.grandparents) {
            assert!(edge.value > 2, "{} -> {} kept at {}", parent.word, edge.word, edge.value);
        }
    }
    assert!(parents.iter().all(|p| p.word != "rare" && p.word != "there"));
    assert!(read_parents(&engine, "other").is_empty());
    assert!(engine.stats().durations.contains_key("defluff"));
}

#[test]
fn test_cleanse_completeness() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine.ingest("one", "say the bad word now");
    engine.ingest("one", "nothing to see");
    engine.ingest("two", "bad start");
    engine.write_cycle().unwrap();
    // Still buffered when the cleanse runs.
    engine.ingest("two", "very bad");

    let before: usize = ["one", "two"]
        .iter()
        .map(|c| read_parents(&engine, c).len())
        .sum();
    let removed = engine.cleanse("bad").unwrap();
    engine.write_cycle().unwrap();

    for chain in ["one", "two"] {
        for parent in read_parents(&engine, chain) {
            assert!(!matches_token(&parent.word, "bad", " "));
            for edge in parent.children.iter().chain(&parent.grandparents) {
                assert!(!matches_token(&edge.word, "bad", " "), "{} still links to bad", parent.word);
            }
        }
    }
    // Per chain: the "bad" parent plus the edge on each side of it.
    // one on disk, two on disk, two buffered.
    assert_eq!(removed, 9);
    assert!(before > 0);
    assert_eq!(engine.cleanse("bad").unwrap(), 0);
}

#[test]
fn test_zip_snapshot_contents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine.ingest("alpha", "hello world");
    engine.ingest("beta", "goodbye world");
    engine.write_cycle().unwrap();

    let outcome = engine.zip().unwrap();
    assert_eq!(outcome.entries, 3);
    let archive_path = dir.path().join("chains.zip");
    assert_eq!(engine.layout().archive_path(), archive_path);

    let mut archive = ZipArchive::new(File::open(&archive_path).unwrap()).unwrap();
    let mut names: Vec<String> = archive.file_names().map(|n| n.to_string()).collect();
    names.sort();
    assert_eq!(
        names,
        vec!["chains/alpha.json", "chains/beta.json", "chains/stats/stats.json"]
    );

    let mut archived = Vec::new();
    archive
        .by_name("chains/alpha.json")
        .unwrap()
        .read_to_end(&mut archived)
        .unwrap();
    let on_disk = std::fs::read(engine.layout().chain_path("alpha").unwrap()).unwrap();
    assert_eq!(archived, on_disk);
}

#[test]
fn test_zip_ignores_stray_stats_document() {
    let dir = tempfile::tempdir().unwrap();
    let chains = dir.path().join("chains");
    std::fs::create_dir_all(&chains).unwrap();
    std::fs::write(chains.join("stats.json"), "{}").unwrap();

    let engine = Engine::open(config(dir.path())).unwrap();
    assert!(engine.known_chains().is_empty());
    engine.ingest("chan", "hello world");
    engine.write_cycle().unwrap();
    assert_eq!(engine.known_chains(), vec!["chan"]);

    let outcome = engine.zip().unwrap();
    assert_eq!(outcome.entries, 2);
}

#[test]
fn test_maintenance_passes_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let engine = std::sync::Arc::new(Engine::open(config(dir.path())).unwrap());
    for i in 0..50 {
        engine.ingest("chan", &format!("line number {} of many", i));
    }
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            std::thread::spawn(move || match i {
                0 => {
                    engine.defluff();
                }
                1 => {
                    engine.zip().unwrap();
                }
                _ => {
                    engine.write_cycle();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    engine.wait_until_idle();
    assert!(!engine.is_busy());
    // Whatever the interleaving, the file is a complete document.
    engine.write_cycle().unwrap();
    let parents = read_parents(&engine, "chan");
    assert!(!parents.is_empty());
}
