//! CLI definition and dispatch.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use configparser::ini::Ini;

use crate::dsl;
use crate::engine::EngineSettings;
use crate::env::ScriptSpec;
use crate::error::BarscriptError;
use crate::feed;
use crate::worker::{self, DataMeta, PaneSpec, Request, Response, SourceFile};

#[derive(Parser, Debug)]
#[command(
    name = "barscript",
    about = "Chart script engine: run indicator scripts over OHLCV data"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every indicator in a script file against CSV data
    Run {
        /// Script file (.bars)
        #[arg(short, long)]
        script: PathBuf,
        /// OHLCV CSV file (time,open,high,low,close,volume)
        #[arg(short, long)]
        data: PathBuf,
        /// Base feed timeframe, e.g. 1m, 1H, 1D
        #[arg(long, default_value = "1D")]
        tf: String,
        /// Engine settings file (INI)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Write overlay output JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Parse a script file and report its descriptors
    Check {
        #[arg(short, long)]
        script: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Run {
            script,
            data,
            tf,
            config,
            output,
        } => run_scripts(&script, &data, &tf, config.as_ref(), output.as_ref()),
        Command::Check { script } => run_check(&script),
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<EngineSettings, BarscriptError> {
    let mut settings = EngineSettings::default();
    let Some(path) = path else {
        return Ok(settings);
    };
    let mut ini = Ini::new();
    ini.load(path).map_err(|e| BarscriptError::ConfigParse {
        file: path.display().to_string(),
        reason: e,
    })?;

    let uint = |ini: &Ini, key: &str| -> Result<Option<usize>, BarscriptError> {
        ini.getuint("engine", key)
            .map_err(|reason| BarscriptError::ConfigInvalid {
                section: "engine".into(),
                key: key.into(),
                reason,
            })
            .map(|v| v.map(|v| v as usize))
    };
    if let Some(depth) = uint(&ini, "depth")? {
        settings.script_depth = Some(depth);
    }
    if let Some(chunk) = uint(&ini, "chunk")? {
        settings.chunk = chunk.max(1);
    }
    settings.ram_limit_mb =
        ini.getfloat("engine", "ram_limit_mb")
            .map_err(|reason| BarscriptError::ConfigInvalid {
                section: "engine".into(),
                key: "ram_limit_mb".into(),
                reason,
            })?;
    Ok(settings)
}

fn run_scripts(
    script: &PathBuf,
    data: &PathBuf,
    tf: &str,
    config: Option<&PathBuf>,
    output: Option<&PathBuf>,
) -> ExitCode {
    match try_run_scripts(script, data, tf, config, output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(&err)
        }
    }
}

fn try_run_scripts(
    script: &PathBuf,
    data: &PathBuf,
    tf: &str,
    config: Option<&PathBuf>,
    output: Option<&PathBuf>,
) -> Result<(), BarscriptError> {
    let settings = load_settings(config)?;
    let src = fs::read_to_string(script)?;
    let name = script
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".into());

    // parse locally first so indicator types are known for the topology
    let parsed = dsl::parse_script(&src, &name)?;
    if parsed.indicators.is_empty() {
        eprintln!("no [INDICATOR] sections in {}", script.display());
    }

    let bars = feed::load_csv(data)?;
    eprintln!("Loaded {} bars from {}", bars.len(), data.display());
    let rows = bars.iter().map(|b| b.to_row()).collect();
    let range = match (bars.first(), bars.last()) {
        (Some(a), Some(b)) => (a.time, b.time),
        _ => (0, 0),
    };

    let handle = worker::spawn(settings);
    let timeout = Duration::from_secs(60);

    let (resp, _) = handle.request(
        Request::UploadLibrary {
            scripts: vec![SourceFile {
                name: name.clone(),
                src,
            }],
        },
        timeout,
    )?;
    if let Response::LibraryUploaded { errors, .. } = &resp {
        for e in errors {
            eprintln!("warning: {e}");
        }
    }

    handle.request(
        Request::UploadData {
            datasets: vec![feed::Dataset::new("ohlcv", rows)],
            meta: DataMeta {
                tf: tf.to_string(),
                range,
            },
        },
        timeout,
    )?;

    let pane = PaneSpec {
        id: "pane-0".into(),
        uuid: "pane-0".into(),
        scripts: parsed
            .indicators
            .iter()
            .enumerate()
            .map(|(i, ind)| ScriptSpec {
                uuid: format!("script-{}", i),
                script_type: ind.type_name.clone(),
                props: Default::default(),
                settings: Default::default(),
                exec_order: i as i64,
            })
            .collect(),
    };

    let (_, events) = handle.request(Request::RunAllScripts { panes: vec![pane] }, timeout)?;

    let mut printed = false;
    for env in events {
        match env.body {
            Response::OverlayData { panes } => {
                let json = serde_json::to_string_pretty(&panes).map_err(|e| {
                    BarscriptError::Data {
                        reason: format!("serialize overlay data: {e}"),
                    }
                })?;
                match output {
                    Some(path) => fs::write(path, json)?,
                    None => println!("{json}"),
                }
                printed = true;
            }
            Response::EngineState(state) => {
                eprintln!(
                    "{} script(s), {} bars in {:.1} ms",
                    state.scripts,
                    state.iter + 1,
                    state.last_perf
                );
            }
            _ => {}
        }
    }
    if !printed {
        eprintln!("run produced no overlay data");
    }
    Ok(())
}

fn run_check(script: &PathBuf) -> ExitCode {
    let src = match fs::read_to_string(script) {
        Ok(src) => src,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(1);
        }
    };
    let name = script
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".into());

    match dsl::parse_script(&src, &name) {
        Ok(parsed) => {
            println!("{} v{}", parsed.name, parsed.version);
            println!(
                "{} overlay(s), {} indicator(s)",
                parsed.overlays.len(),
                parsed.indicators.len()
            );
            for ov in &parsed.overlays {
                println!("  [OVERLAY] {}", ov.name);
            }
            for ind in &parsed.indicators {
                println!("  [INDICATOR] {}", ind.type_name);
                for prop in &ind.props {
                    println!(
                        "    prop {} ({}) = {:?}",
                        prop.name, prop.ptype, prop.default
                    );
                }
            }
            for w in &parsed.warnings {
                println!("warning: {w}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e.display_with_context(&src));
            let err: BarscriptError = e.into();
            ExitCode::from(&err)
        }
    }
}
