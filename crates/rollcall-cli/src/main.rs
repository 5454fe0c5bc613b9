use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::{Direction, FrameResult, LandmarkSet, SessionStatus, SIMILARITY_THRESHOLD};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn submit_frame(&self, frame: &str) -> zbus::Result<String>;
    fn commit(&self, direction: &str) -> zbus::Result<String>;
    fn reset(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn set_emotion_analysis(&self, enabled: bool) -> zbus::Result<String>;
    fn enroll(&self, name: &str, class_group: &str, template: &str) -> zbus::Result<String>;
    fn add_note(&self, identity_id: &str, author: &str, text: &str) -> zbus::Result<String>;
    fn list_events(&self, identity_id: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon and session status
    Status,
    /// Record the recognized identity's arrival or departure
    Commit {
        /// arrival | departure
        direction: Direction,
    },
    /// Discard the current recognition
    Reset,
    /// Stream detector results from a JSON-lines file into the daemon
    Replay {
        file: PathBuf,
        /// Delay between frames
        #[arg(long, default_value_t = 33)]
        interval_ms: u64,
    },
    /// Register a new identity
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        class_group: Option<String>,
        /// JSON landmark array; omit to register without biometrics
        #[arg(short, long)]
        template: Option<PathBuf>,
    },
    /// Attach a therapist note to an identity
    Note {
        identity_id: String,
        #[arg(short, long)]
        author: String,
        text: String,
    },
    /// List recorded attendance events
    Events {
        #[arg(short, long)]
        identity: Option<String>,
    },
    /// Turn affective-state analysis on or off
    Emotion {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Compare two landmark templates without the daemon
    Compare {
        a: PathBuf,
        b: PathBuf,
        #[arg(long, default_value_t = SIMILARITY_THRESHOLD)]
        threshold: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Offline; no daemon needed.
    if let Commands::Compare { a, b, threshold } = &cli.command {
        return compare_files(a, b, *threshold);
    }

    tracing::debug!(system = cli.system, "connecting to rollcalld");
    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Commit { direction } => {
            let event = proxy.commit(direction.as_str()).await?;
            print_json(&event)?;
        }
        Commands::Reset => {
            proxy.reset().await?;
            println!("session reset");
        }
        Commands::Replay { file, interval_ms } => replay(&proxy, &file, Duration::from_millis(interval_ms)).await?,
        Commands::Enroll {
            name,
            class_group,
            template,
        } => {
            let template = match template {
                Some(path) => serde_json::to_string(&read_template(&path)?)?,
                None => String::new(),
            };
            let id = proxy
                .enroll(&name, class_group.as_deref().unwrap_or(""), &template)
                .await?;
            println!("enrolled {name}: {id}");
        }
        Commands::Note {
            identity_id,
            author,
            text,
        } => print_json(&proxy.add_note(&identity_id, &author, &text).await?)?,
        Commands::Events { identity } => {
            print_json(&proxy.list_events(identity.as_deref().unwrap_or("")).await?)?;
        }
        Commands::Emotion { state } => {
            let status = proxy.set_emotion_analysis(matches!(state, Toggle::On)).await?;
            let status: SessionStatus = serde_json::from_str(&status)?;
            println!("emotion analysis: {} ({})", if status.emotion_analysis { "on" } else { "off" }, status.emotion);
        }
        Commands::Compare { a, b, threshold } => compare_files(&a, &b, threshold)?,
    }

    Ok(())
}

async fn replay(proxy: &AttendanceProxy<'_>, path: &Path, interval: Duration) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let frames = parse_frames(&text)?;
    println!("replaying {} frames from {}", frames.len(), path.display());

    let mut last_phase = None;
    for (line, frame) in frames {
        let status: SessionStatus = serde_json::from_str(&proxy.submit_frame(&frame).await?)?;
        tracing::debug!(line, phase = %status.phase, "frame submitted");
        if last_phase != Some(status.phase) {
            let who = status.identity.as_ref().map(|i| i.name.as_str()).unwrap_or("-");
            println!("line {line}: {} (identity: {who}, emotion: {})", status.phase, status.emotion);
            last_phase = Some(status.phase);
        }
        tokio::time::sleep(interval).await;
    }
    Ok(())
}

/// Validate a JSON-lines frame file. Yields (line number, raw JSON) per frame.
fn parse_frames(text: &str) -> Result<Vec<(usize, String)>> {
    let mut frames = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        serde_json::from_str::<FrameResult>(line).with_context(|| format!("line {}: invalid frame", idx + 1))?;
        frames.push((idx + 1, line.to_string()));
    }
    Ok(frames)
}

fn read_template(path: &Path) -> Result<LandmarkSet> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a landmark array", path.display()))
}

fn compare_files(a: &Path, b: &Path, threshold: f32) -> Result<()> {
    let (similarity, matched) = compare_templates(&read_template(a)?, &read_template(b)?, threshold)?;
    let verdict = if matched { "match" } else { "no match" };
    println!("similarity: {similarity:.4} ({verdict} at threshold {threshold:.2})");
    Ok(())
}

fn compare_templates(a: &LandmarkSet, b: &LandmarkSet, threshold: f32) -> Result<(f32, bool)> {
    if a.is_empty() || b.is_empty() {
        bail!("cannot compare an empty template");
    }
    let similarity = a.to_feature_vector().similarity(&b.to_feature_vector())?;
    Ok((similarity, similarity >= threshold))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::LandmarkPoint;
    use std::io::Write;

    fn set(points: &[[f32; 3]]) -> LandmarkSet {
        LandmarkSet::new(points.iter().map(|p| LandmarkPoint::new(p[0], p[1], p[2])).collect())
    }

    #[test]
    fn test_compare_identical() {
        let a = set(&[[0.5, 0.4, 0.0], [0.6, 0.4, 0.1]]);
        let (sim, matched) = compare_templates(&a, &a, SIMILARITY_THRESHOLD).unwrap();
        assert!((sim - 1.0).abs() < 1e-5);
        assert!(matched);
    }

    #[test]
    fn test_compare_rejects_mismatch_and_empty() {
        let a = set(&[[0.5, 0.4, 0.0]]);
        let b = set(&[[0.5, 0.4, 0.0], [0.1, 0.1, 0.1]]);
        assert!(compare_templates(&a, &b, SIMILARITY_THRESHOLD).is_err());
        assert!(compare_templates(&a, &LandmarkSet::default(), SIMILARITY_THRESHOLD).is_err());
    }

    #[test]
    fn test_parse_frames_skips_blank_and_comments() {
        let text = "# captured 2024-03-11\n{}\n\n{\"landmarks\":[{\"x\":0.1,\"y\":0.2,\"z\":0.0}]}\n";
        let frames = parse_frames(text).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, 2);
        assert_eq!(frames[1].0, 4);
    }

    #[test]
    fn test_parse_frames_reports_line() {
        let err = parse_frames("{}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_read_template_file() {
        let mut tf = tempfile::NamedTempFile::new().unwrap();
        write!(tf, r#"[{{"x":0.1,"y":0.2,"z":0.3}}]"#).unwrap();
        let template = read_template(tf.path()).unwrap();
        assert_eq!(template.len(), 1);
    }
}
