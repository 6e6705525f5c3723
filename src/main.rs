use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use fovea::cluster::{refresh_face_vectors, ClusteringEngine};
use fovea::config::Config;
use fovea::embed::OnnxProvider;
use fovea::intent::IntentClient;
use fovea::scan::{ScanStage, ScanSupervisor};
use fovea::search::{rerank, RetrievalEngine, SortKey};
use fovea::store::{NewPhoto, VectorStore};
use fovea::logging;

struct Args {
    config_path: Option<PathBuf>,
    command: Vec<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut command = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("fovea {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            other => command.push(other.to_string()),
        }
        i += 1;
    }

    Args { config_path, command }
}

fn print_help() {
    println!(
        r#"fovea - face and semantic indexing engine for photo libraries

USAGE:
    fovea [OPTIONS] <COMMAND>

COMMANDS:
    register <dir>            Register photos under a directory
    scan                      Scan unprocessed photos for faces
    resume <job-id>           Resume an interrupted scan
    cancel                    Cancel the active scan
    status                    Show queue and job status
    match [threshold]         Group unassigned faces into persons
    search <query...>         Hybrid keyword+vector search
    quick <query...>          Vector-only search
    people                    List persons with face counts
    merge <source> <target>   Merge one person into another
    unassign <face-id>        Detach a face from its person
    similar <face-id>         Faces similar to the given one
    refresh                   Re-embed detections with stale vectors
    reset                     Wipe detections and automatic persons

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FOVEA_LOG           Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/fovea/config.toml"#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(None);

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let store = Arc::new(VectorStore::open(&config.db_path)?);

    let mut command = args.command.iter().map(String::as_str);
    match command.next() {
        Some("register") => {
            let Some(dir) = command.next() else { bail!("register requires a directory") };
            cmd_register(&store, &config, Path::new(dir))
        }
        Some("scan") => cmd_scan(&store, &config),
        Some("resume") => {
            let Some(id) = command.next() else { bail!("resume requires a job id") };
            cmd_resume(&store, &config, id.parse()?)
        }
        Some("cancel") => cmd_cancel(&store, &config),
        Some("status") => cmd_status(&store, &config),
        Some("match") => {
            let threshold = command.next().map(str::parse).transpose()?;
            cmd_match(&store, &config, threshold)
        }
        Some("search") => {
            let query: Vec<&str> = command.collect();
            cmd_search(&store, &config, &query.join(" "))
        }
        Some("quick") => {
            let query: Vec<&str> = command.collect();
            cmd_quick(&store, &config, &query.join(" "))
        }
        Some("people") => cmd_people(&store),
        Some("merge") => {
            let (Some(source), Some(target)) = (command.next(), command.next()) else {
                bail!("merge requires source and target person ids");
            };
            cmd_merge(&store, &config, source.parse()?, target.parse()?)
        }
        Some("unassign") => {
            let Some(id) = command.next() else { bail!("unassign requires a face id") };
            cmd_unassign(&store, &config, id.parse()?)
        }
        Some("similar") => {
            let Some(id) = command.next() else { bail!("similar requires a face id") };
            cmd_similar(&store, &config, id.parse()?)
        }
        Some("refresh") => cmd_refresh(&store, &config),
        Some("reset") => cmd_reset(&store),
        Some(other) => bail!("unknown command: {other} (try --help)"),
        None => {
            print_help();
            Ok(())
        }
    }
}

fn supervisor(store: &Arc<VectorStore>, config: &Config) -> ScanSupervisor {
    ScanSupervisor::new(
        Arc::clone(store),
        Arc::new(OnnxProvider::new(&config.embed)),
        config.scan.clone(),
        config.cluster.clone(),
    )
}

/// Stand-in for the ingestion collaborator: walk a directory and register
/// every image file. Photo identity is a stable digest of the path, so
/// re-registration is a no-op.
fn cmd_register(store: &VectorStore, config: &Config, dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut registered = 0usize;
    let mut seen = 0usize;

    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !config.scan.image_extensions.contains(&extension) {
            continue;
        }
        seen += 1;

        let path_str = path.to_string_lossy().to_string();
        let dimensions = image::image_dimensions(path).ok();
        let taken_at = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());

        let before = store.photo_by_path(&path_str)?.is_some();
        store.insert_photo(&NewPhoto {
            uuid: stable_uuid(&path_str),
            path: path_str.clone(),
            filename: entry.file_name().to_string_lossy().to_string(),
            directory: path.parent().map(|p| p.to_string_lossy().to_string()).unwrap_or_default(),
            taken_at,
            width: dimensions.map(|(w, _)| w as i64),
            height: dimensions.map(|(_, h)| h as i64),
            exif_json: None,
            location_json: None,
        })?;
        if !before {
            registered += 1;
        }
    }

    println!("Registered {registered} new photos ({seen} seen)");
    Ok(())
}

/// Stable pseudo-uuid derived from the photo path.
fn stable_uuid(path: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    format!("ph-{:016x}", hasher.finish())
}

fn cmd_scan(store: &Arc<VectorStore>, config: &Config) -> Result<()> {
    let supervisor = supervisor(store, config);

    if let Some(job) = supervisor.active_job()? {
        bail!(
            "job {} is still active ({}/{} processed); resume or cancel it",
            job.id,
            job.processed_photos,
            job.total_photos
        );
    }

    let total = store.count_unprocessed_photos(0)?;
    if total == 0 {
        println!("Nothing to scan");
        return Ok(());
    }

    let (tx, rx) = mpsc::channel();
    let job_id = supervisor.start_scan(total, Some(tx))?;
    println!("Scanning {total} photos (job {job_id})");
    watch_progress(rx);
    supervisor.wait();

    report_job(&supervisor, job_id)
}

fn cmd_resume(store: &Arc<VectorStore>, config: &Config, job_id: i64) -> Result<()> {
    let supervisor = supervisor(store, config);
    let (tx, rx) = mpsc::channel();
    supervisor.resume_scan(job_id, Some(tx))?;
    println!("Resuming job {job_id}");
    watch_progress(rx);
    supervisor.wait();

    report_job(&supervisor, job_id)
}

fn watch_progress(rx: mpsc::Receiver<fovea::ScanProgress>) {
    while let Ok(progress) = rx.recv() {
        match progress.stage {
            ScanStage::Detecting => {
                let file = progress.current_file.as_deref().unwrap_or("");
                println!(
                    "  [{}/{}] {} ({} faces)",
                    progress.current, progress.total, file, progress.detected_faces
                );
            }
            ScanStage::Clustering => println!("  clustering..."),
            _ => {}
        }
        if progress.is_terminal() {
            break;
        }
    }
}

fn report_job(supervisor: &ScanSupervisor, job_id: i64) -> Result<()> {
    if let Some(job) = supervisor.job_by_id(job_id)? {
        println!(
            "Job {} {}: {} processed, {} failed{}",
            job.id,
            job.status.as_str(),
            job.processed_photos,
            job.failed_photos,
            job.error_message.map(|e| format!(" ({e})")).unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_cancel(store: &Arc<VectorStore>, config: &Config) -> Result<()> {
    let supervisor = supervisor(store, config);
    if supervisor.cancel_scan()? {
        println!("Cancelled");
    } else {
        println!("No active scan");
    }
    Ok(())
}

fn cmd_status(store: &Arc<VectorStore>, config: &Config) -> Result<()> {
    let supervisor = supervisor(store, config);

    match supervisor.active_job()? {
        Some(job) => println!(
            "Job {}: {} of {} processed, {} failed, checkpoint at photo {}",
            job.id, job.processed_photos, job.total_photos, job.failed_photos, job.last_processed_id
        ),
        None => println!("No active job"),
    }

    println!(
        "Library: {} photos, {} unprocessed, {} faces, {} persons",
        store.count_photos()?,
        store.count_unprocessed_photos(0)?,
        store.count_faces()?,
        store.count_persons()?
    );
    Ok(())
}

fn cmd_match(store: &Arc<VectorStore>, config: &Config, threshold: Option<f32>) -> Result<()> {
    let engine = ClusteringEngine::new(Arc::clone(store), config.cluster.clone());
    let outcome = engine.auto_match(threshold)?;
    println!(
        "Matched {} faces, created {} persons ({} clusters found)",
        outcome.matched,
        outcome.persons_created,
        outcome.clusters.len()
    );
    for cluster in &outcome.clusters {
        match cluster.person_id {
            Some(person_id) => println!(
                "  person {person_id}: {} faces, confidence {:.2}",
                cluster.size, cluster.confidence
            ),
            None => println!("  singleton left unassigned"),
        }
    }
    Ok(())
}

fn cmd_search(store: &Arc<VectorStore>, config: &Config, query: &str) -> Result<()> {
    if query.is_empty() {
        bail!("search requires a query");
    }

    let intent = IntentClient::new(config.intent.clone()).classify(query);
    let provider = Arc::new(OnnxProvider::new(&config.embed));
    let engine = RetrievalEngine::new(Arc::clone(store), provider, config.search.clone());

    let mut results = engine.search(query, None, intent)?;
    rerank(&mut results, SortKey::Combined);

    if results.is_empty() {
        println!("No results");
        return Ok(());
    }
    for result in &results {
        println!(
            "{:6.3}  kw {:5.1}  vec {:.3}  {}",
            result.score, result.keyword_score, result.vector_similarity, result.path
        );
    }
    Ok(())
}

fn cmd_quick(store: &Arc<VectorStore>, config: &Config, query: &str) -> Result<()> {
    if query.is_empty() {
        bail!("quick requires a query");
    }

    let provider = Arc::new(OnnxProvider::new(&config.embed));
    let engine = RetrievalEngine::new(Arc::clone(store), provider, config.search.clone());

    for result in engine.quick_search(query, 20)? {
        println!("{:.3}  {}", result.vector_similarity, result.path);
    }
    Ok(())
}

fn cmd_people(store: &VectorStore) -> Result<()> {
    let persons = store.persons()?;
    if persons.is_empty() {
        println!("No persons yet");
        return Ok(());
    }
    for person in persons {
        let kind = if person.is_manual { "manual" } else { "auto" };
        println!("{:4}  {:24} {:4} faces  ({kind})", person.id, person.name, person.face_count);
    }
    Ok(())
}

fn cmd_merge(store: &Arc<VectorStore>, config: &Config, source: i64, target: i64) -> Result<()> {
    let engine = ClusteringEngine::new(Arc::clone(store), config.cluster.clone());
    let moved = engine.merge_persons(source, target)?;
    println!("Moved {moved} faces from person {source} to person {target}");
    Ok(())
}

fn cmd_unassign(store: &Arc<VectorStore>, config: &Config, face_id: i64) -> Result<()> {
    let engine = ClusteringEngine::new(Arc::clone(store), config.cluster.clone());
    engine.unassign_face(face_id)?;
    println!("Face {face_id} unassigned");
    Ok(())
}

fn cmd_similar(store: &Arc<VectorStore>, config: &Config, face_id: i64) -> Result<()> {
    let engine = ClusteringEngine::new(Arc::clone(store), config.cluster.clone());
    let similar = engine.find_similar_faces(face_id)?;
    if similar.is_empty() {
        println!("No similar faces above the floor");
        return Ok(());
    }
    for face in similar {
        println!(
            "face {:5}  photo {:5}  sim {:.3}  person {}",
            face.face_id,
            face.photo_id,
            face.similarity,
            face.person_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn cmd_refresh(store: &Arc<VectorStore>, config: &Config) -> Result<()> {
    let provider = OnnxProvider::new(&config.embed);
    let outcome = refresh_face_vectors(store, &provider)?;
    println!(
        "Refreshed {} detections, {} failed{}",
        outcome.refreshed,
        outcome.failed,
        outcome.last_error.map(|e| format!(" (last error: {e})")).unwrap_or_default()
    );
    Ok(())
}

fn cmd_reset(store: &VectorStore) -> Result<()> {
    store.reset_detections()?;
    println!("Detections and automatic persons wiped");
    Ok(())
}
