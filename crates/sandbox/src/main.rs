use std::env;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, bail};
use sandbox::launcher::build_launcher;
use sandbox::{
    ExecutionLimits, ExecutionRequest, ExecutionSupervisor, OutputEvent, SandboxLaunchConfig,
};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "usage: forge-run '<command>' [file ...]\n\nRuns the command in a fresh sandbox with the given files staged in its workspace."
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        bail!(usage());
    };

    let mut request = ExecutionRequest::new(command);
    for path in args {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {path}"))?;
        let name = Path::new(&path)
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("{path} has no usable file name"))?
            .to_owned();
        request = request.with_file(name, bytes);
    }

    let mut config = SandboxLaunchConfig::default();
    if let Ok(docker_bin) = env::var("FORGE_DOCKER_BIN") {
        config.docker_bin = docker_bin;
    }
    if let Ok(image) = env::var("FORGE_SANDBOX_IMAGE") {
        config.image = image;
    }

    let supervisor = ExecutionSupervisor::new(build_launcher(config), ExecutionLimits::default());
    let start = Instant::now();
    let mut stream = supervisor.start(request).await?;
    eprintln!("sandbox: {}", stream.sandbox_id());

    let mut code = 0;
    while let Some(event) = stream.next().await {
        match &event {
            OutputEvent::Line(_) => println!("{event}"),
            OutputEvent::ExitCode(exit) => {
                code = *exit;
                eprintln!("{event}");
            }
            _ => {
                code = 1;
                eprintln!("{event}");
            }
        }
    }
    eprintln!("elapsed: {:.2}s", start.elapsed().as_secs_f64());
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
