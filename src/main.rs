use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use facesift::db::{EventState, Role};
use facesift::engine::{Probe, SearchRequest};
use facesift::ingest::{accepted_extension, Upload};
use facesift::logging::{self, Fallback};
use facesift::{Config, Engine, RequestContext};

/// Parsed command line: positional words plus `--flag value` options.
struct Args {
    config_path: Option<PathBuf>,
    acting_user: Option<i64>,
    words: Vec<String>,
    options: HashMap<String, String>,
    switches: Vec<String>,
}

/// Options that take a value; everything else starting with `--` is a switch.
const VALUE_OPTIONS: &[&str] = &["--role", "--code", "--event", "--tolerance"];

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: None,
        acting_user: None,
        words: Vec::new(),
        options: HashMap::new(),
        switches: Vec::new(),
    };

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facesift {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let path = args.get(i + 1).context("--config requires a path argument")?;
                parsed.config_path = Some(PathBuf::from(path));
                i += 1;
            }
            "--as" => {
                let id = args.get(i + 1).context("--as requires a user id")?;
                parsed.acting_user = Some(id.parse().with_context(|| format!("Invalid user id '{}'", id))?);
                i += 1;
            }
            _ if VALUE_OPTIONS.contains(&arg) => {
                let value = args
                    .get(i + 1)
                    .with_context(|| format!("{} requires a value", arg))?;
                parsed.options.insert(arg.to_string(), value.clone());
                i += 1;
            }
            _ if arg.starts_with("--") => parsed.switches.push(arg.to_string()),
            _ => parsed.words.push(arg.to_string()),
        }
        i += 1;
    }

    Ok(parsed)
}

fn print_help() {
    println!(
        r#"facesift - find every event photo a face appears in

USAGE:
    facesift [OPTIONS] <COMMAND>

COMMANDS:
    user add NAME [--role organizer|admin|student]
    event create NAME                 Create a draft event (organizer)
    event publish EVENT_ID            Make the event searchable by code
    event unpublish EVENT_ID
    event code EVENT_ID               Issue a new access code
    event status EVENT_ID             Processing progress
    event usage EVENT_ID              Storage used against the quota
    event lookup CODE                 Public summary of a published event
    event delete EVENT_ID
    ingest EVENT_ID PATH...           Upload files or directories
    search IMAGE [--code CODE] [--event ID] [--tolerance T]
    search --registered [--code CODE] [--event ID]
    retry PHOTO_ID                    Re-queue a failed or completed photo
    delete-photo PHOTO_ID
    register-face IMAGE               Store your face for later searches
    register-face --remove

OPTIONS:
    --as USER_ID        Act as this user
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACESIFT_CONFIG     Path to config file (overrides default location)
    FACESIFT_LOG        Log level (trace, debug, info, warn, error)

Uploaded photos are encoded by facesift-daemon. Output is JSON.
Config file location: $XDG_CONFIG_HOME/facesift/config.toml"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // Journald on Linux, rolling file otherwise
    let _ = logging::init(Fallback::File(None));

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let engine = Engine::open(config)?;
    let ctx = request_context(&engine, args.acting_user)?;

    let words: Vec<&str> = args.words.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["user", "add", name] => {
            let role: Role = args
                .options
                .get("--role")
                .map(|r| r.parse())
                .transpose()?
                .unwrap_or(Role::Student);
            let user = engine.create_user(name, role)?;
            print_json(&json!({ "id": user.id, "name": user.name, "role": user.role.to_string() }))
        }
        ["event", "create", name] => {
            let event = engine.create_event(&ctx, name)?;
            print_json(&engine.event_summary(&ctx, event.id)?)
        }
        ["event", "publish", id] => {
            engine.set_event_status(&ctx, parse_id(id)?, EventState::Published)?;
            print_json(&engine.event_summary(&ctx, parse_id(id)?)?)
        }
        ["event", "unpublish", id] => {
            engine.set_event_status(&ctx, parse_id(id)?, EventState::Draft)?;
            print_json(&engine.event_summary(&ctx, parse_id(id)?)?)
        }
        ["event", "code", id] => {
            let code = engine.issue_access_code(&ctx, parse_id(id)?)?;
            print_json(&json!({ "event_id": parse_id(id)?, "access_code": code }))
        }
        ["event", "status", id] => print_json(&engine.status(&ctx, parse_id(id)?)?),
        ["event", "usage", id] => print_json(&engine.storage_usage(&ctx, parse_id(id)?)?),
        ["event", "lookup", code] => print_json(&engine.lookup_event_by_code(code)?),
        ["event", "delete", id] => {
            engine.delete_event(&ctx, parse_id(id)?)?;
            print_json(&json!({ "deleted_event": parse_id(id)? }))
        }
        ["ingest", id, paths @ ..] if !paths.is_empty() => {
            ingest(&engine, &ctx, parse_id(id)?, paths)
        }
        ["search", rest @ ..] => search(&engine, &ctx, &args, rest).await,
        ["retry", id] => {
            engine.retry(&ctx, parse_id(id)?)?;
            print_json(&json!({ "requeued_photo": parse_id(id)? }))
        }
        ["delete-photo", id] => {
            engine.delete_photo(&ctx, parse_id(id)?)?;
            print_json(&json!({ "deleted_photo": parse_id(id)? }))
        }
        ["register-face"] if args.switches.iter().any(|s| s == "--remove") => {
            let removed = engine.remove_registered_face(&ctx)?;
            print_json(&json!({ "removed": removed }))
        }
        ["register-face", image] => {
            let bytes = read_file(Path::new(image))?;
            engine.register_face(&ctx, bytes).await?;
            print_json(&json!({ "registered": true }))
        }
        [] => {
            print_help();
            Ok(())
        }
        _ => {
            print_help();
            bail!("Unknown command: {}", words.join(" "))
        }
    }
}

/// Resolve `--as` into a request identity; no flag means anonymous.
fn request_context(engine: &Engine, acting_user: Option<i64>) -> Result<RequestContext> {
    let Some(user_id) = acting_user else {
        return Ok(RequestContext::anonymous());
    };
    let user = engine
        .db()
        .get_user(user_id)?
        .ok_or_else(|| anyhow!("No user with id {}", user_id))?;
    Ok(RequestContext::user(user.id, user.role))
}

fn ingest(engine: &Engine, ctx: &RequestContext, event_id: i64, paths: &[&str]) -> Result<()> {
    let mut files = Vec::new();
    for path in paths {
        files.extend(discover_images(Path::new(path), &engine.config().ingest.allowed_extensions)?);
    }
    tracing::info!(event_id, files = files.len(), "Ingesting files");

    let mut results = Vec::with_capacity(files.len());
    for file in files {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        let bytes = read_file(&file)?;

        for outcome in engine.ingest(ctx, event_id, vec![Upload::new(filename, bytes)])? {
            results.push(match outcome.result {
                Ok(photo_id) => json!({ "file": file.display().to_string(), "photo_id": photo_id }),
                Err(e) => json!({ "file": file.display().to_string(), "error": e.to_string() }),
            });
        }
    }
    print_json(&results)
}

/// Files under `path` (or `path` itself) with an accepted extension.
///
/// A file named explicitly is always passed on so its rejection is reported.
fn discover_images(path: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("No such file or directory: {}", path.display());
    }

    let config = facesift::config::IngestConfig {
        allowed_extensions: extensions.to_vec(),
        ..Default::default()
    };
    let mut images: Vec<PathBuf> = WalkDir::new(path)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|name| accepted_extension(name, &config).is_some())
        })
        .map(|e| e.into_path())
        .collect();
    images.sort();
    Ok(images)
}

async fn search(engine: &Engine, ctx: &RequestContext, args: &Args, rest: &[&str]) -> Result<()> {
    let probe = match rest {
        [] if args.switches.iter().any(|s| s == "--registered") => Probe::RegisteredFace,
        [image] => Probe::Image(read_file(Path::new(image))?),
        _ => bail!("search needs an IMAGE or --registered"),
    };

    let request = SearchRequest {
        probe,
        event_id: args.options.get("--event").map(|id| parse_id(id)).transpose()?,
        access_code: args.options.get("--code").cloned(),
        tolerance: args
            .options
            .get("--tolerance")
            .map(|t| t.parse::<f32>().with_context(|| format!("Invalid tolerance '{}'", t)))
            .transpose()?,
    };

    let matches = engine.search(ctx, request).await?;
    let photos: Vec<_> = matches
        .into_iter()
        .map(|m| {
            let photo = engine.db().get_photo(m.photo_id).ok().flatten();
            json!({
                "photo_id": m.photo_id,
                "event_id": m.event_id,
                "confidence": m.confidence,
                "face_index": m.face_index,
                "filename": photo.map(|p| p.filename),
            })
        })
        .collect();
    print_json(&photos)
}

fn parse_id(value: &str) -> Result<i64> {
    value
        .parse()
        .with_context(|| format!("Invalid id '{}'", value))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
