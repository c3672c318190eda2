//! Command-line interface for the map editing engine.
//!
//! Three subcommands cover the offline workflow: `fetch` downloads a region
//! or Overpass result into an archive, `info` summarizes an archive, and
//! `check-query` runs the Overpass validator without touching the network.
#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use eyre::{WrapErr, bail};
use geo::{Coord, Rect};
use log::info;
use mapedit_core::{CommentContextProvider, MapData, Tags, read_archive, write_archive};
use mapedit_sync::{FetchRequest, OsmClient, validate_query};

/// Run the CLI with the current process arguments.
///
/// # Errors
///
/// Any failure in the invoked subcommand, ready for top-level reporting.
pub fn run() -> eyre::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Fetch(args) => run_fetch(&args),
        Command::Info { archive } => run_info(&archive),
        Command::CheckQuery { query } => run_check_query(&query),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "mapedit",
    about = "Offline editing utilities for OpenStreetMap data",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download a region or Overpass result into a new archive.
    Fetch(FetchArgs),
    /// Summarize an archive: entity counts, pending edits, undo depth.
    Info {
        /// Archive file to inspect.
        archive: PathBuf,
    },
    /// Validate an Overpass QL query without issuing any request.
    CheckQuery {
        /// Query text, or a path to a file containing it.
        query: String,
    },
}

/// Arguments for the `fetch` subcommand.
#[derive(Debug, Parser)]
struct FetchArgs {
    /// Base URL of the editing API.
    #[arg(long, default_value = "https://api.openstreetmap.org")]
    server: String,
    /// Bounding box as `left,bottom,right,top` in degrees.
    #[arg(
        long,
        value_name = "L,B,R,T",
        conflicts_with = "overpass_query",
        required_unless_present = "overpass_query"
    )]
    bbox: Option<String>,
    /// Overpass QL query text, or a path to a file containing it.
    #[arg(long, value_name = "FILE|QUERY")]
    overpass_query: Option<String>,
    /// Archive file to write.
    #[arg(long, value_name = "path")]
    out: PathBuf,
}

/// Changeset context tags stamped onto every edit group made via the CLI.
fn comment_context() -> CommentContextProvider {
    Box::new(|comment| {
        let mut tags = Tags::new();
        tags.insert("comment".to_owned(), comment.to_owned());
        tags.insert(
            "created_by".to_owned(),
            format!("mapedit {}", env!("CARGO_PKG_VERSION")),
        );
        tags
    })
}

fn run_fetch(args: &FetchArgs) -> eyre::Result<()> {
    let request = match (&args.bbox, &args.overpass_query) {
        (Some(bbox), None) => FetchRequest::BoundingBox(parse_bbox(bbox)?),
        (None, Some(query)) => FetchRequest::Overpass(query_text(query)?),
        // clap enforces exactly one of the two.
        _ => bail!("exactly one of --bbox and --overpass-query is required"),
    };
    let client = OsmClient::new(args.server.clone())?;
    let mut map = MapData::new(comment_context());
    let outcome = client.download_into(&mut map, &request)?;
    info!("downloaded {} entities", outcome.applied);

    let file = fs::File::create(&args.out)
        .wrap_err_with(|| format!("cannot create {}", args.out.display()))?;
    write_archive(&map, file)?;
    println!(
        "saved {} nodes, {} ways, {} relations to {}",
        map.node_count(),
        map.way_count(),
        map.relation_count(),
        args.out.display()
    );
    Ok(())
}

fn run_info(archive: &Path) -> eyre::Result<()> {
    let file = fs::File::open(archive)
        .wrap_err_with(|| format!("cannot open {}", archive.display()))?;
    let map = read_archive(file, comment_context())?;
    println!("{}", info_summary(&map));
    Ok(())
}

fn run_check_query(query: &str) -> eyre::Result<()> {
    let text = query_text(query)?;
    match validate_query(&text) {
        Ok(()) => {
            println!("query ok");
            Ok(())
        }
        Err(err) => bail!("invalid query: {err}"),
    }
}

/// Resolve a query argument: a path to a readable file wins, otherwise the
/// argument is taken as the query text itself.
fn query_text(argument: &str) -> eyre::Result<String> {
    let path = Path::new(argument);
    if path.is_file() {
        fs::read_to_string(path).wrap_err_with(|| format!("cannot read {}", path.display()))
    } else {
        Ok(argument.to_owned())
    }
}

/// Parse a `left,bottom,right,top` bounding box in degrees.
fn parse_bbox(text: &str) -> eyre::Result<Rect<f64>> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    let [left, bottom, right, top] = parts.as_slice() else {
        bail!("bounding box must be four comma-separated numbers, got `{text}`");
    };
    let parse = |name: &str, value: &str| -> eyre::Result<f64> {
        value
            .parse()
            .wrap_err_with(|| format!("{name} coordinate `{value}` is not a number"))
    };
    let left = parse("left", left)?;
    let bottom = parse("bottom", bottom)?;
    let right = parse("right", right)?;
    let top = parse("top", top)?;
    if left >= right || bottom >= top {
        bail!("bounding box `{text}` is empty: left < right and bottom < top required");
    }
    Ok(Rect::new(
        Coord { x: left, y: bottom },
        Coord { x: right, y: top },
    ))
}

fn info_summary(map: &MapData) -> String {
    let pending = map.pending_edits();
    format!(
        "nodes: {}\nways: {}\nrelations: {}\npending created: {}\npending modified: {}\npending deleted: {}\nundo depth: {}\nredo depth: {}",
        map.node_count(),
        map.way_count(),
        map.relation_count(),
        pending.created.len(),
        pending.modified.len(),
        pending.deleted.len(),
        map.undo_depth(),
        map.redo_depth(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn parses_a_valid_bbox() {
        let rect = parse_bbox("7.1, 50.7, 7.25, 50.8").expect("valid bbox");
        assert_eq!(rect.min(), Coord { x: 7.1, y: 50.7 });
        assert_eq!(rect.max(), Coord { x: 7.25, y: 50.8 });
    }

    #[rstest]
    #[case("7.1,50.7,7.25")]
    #[case("7.1,50.7,7.25,50.8,9")]
    #[case("7.1,50.7,7.25,abc")]
    #[case("7.25,50.7,7.1,50.8")]
    #[case("7.1,50.8,7.25,50.7")]
    fn rejects_malformed_bboxes(#[case] text: &str) {
        assert!(parse_bbox(text).is_err());
    }

    #[rstest]
    fn query_argument_falls_back_to_literal_text() {
        let text = query_text("node(1);out;").expect("literal text");
        assert_eq!(text, "node(1);out;");
    }

    #[rstest]
    fn query_argument_reads_an_existing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("query.oql");
        fs::write(&path, "way[highway];out;").expect("write query");

        let text = query_text(path.to_str().expect("utf-8 path")).expect("read query");

        assert_eq!(text, "way[highway];out;");
    }

    #[rstest]
    fn info_summary_reports_pending_edits() {
        let mut map = MapData::new(comment_context());
        map.create_node(Coord { x: 7.0, y: 50.0 }).expect("valid coord");

        let summary = info_summary(&map);

        assert!(summary.contains("nodes: 1"));
        assert!(summary.contains("pending created: 1"));
        assert!(summary.contains("undo depth: 1"));
    }

    #[rstest]
    fn archives_written_by_fetch_are_readable_by_info() {
        let mut map = MapData::new(comment_context());
        map.create_node(Coord { x: 7.0, y: 50.0 }).expect("valid coord");
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("region.mped");
        let file = fs::File::create(&path).expect("create archive");
        write_archive(&map, file).expect("write archive");

        assert!(run_info(&path).is_ok());
    }
}
