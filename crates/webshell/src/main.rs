use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use uuid::Uuid;
use webshell::config::ShellConfig;
use webshell::docker::DockerCli;
use webshell::engine::EngineClient;
use webshell::session::Session;
use webshell::signals::shutdown_signal;
use webshell::spec::SandboxSpecBuilder;
use webshell::telemetry::{DEFAULT_DIRECTIVE, init_tracing};
use webshell::terminal::run_session;
use webshell::transport::ByteTransport;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

async fn run() -> anyhow::Result<u8> {
    let config = ShellConfig::from_env();
    let engine = EngineClient::new(
        Arc::new(DockerCli::new(config.docker_bin.clone())),
        config.timeouts,
    );
    engine
        .probe()
        .await
        .context("container engine is not reachable")?;

    let id = Uuid::new_v4();
    let spec = SandboxSpecBuilder::new(config.policy.clone()).build(&id);
    let session = Arc::new(Session::new(id, spec, engine, config.session));

    let code = run_session(
        session,
        ByteTransport::terminal(),
        shutdown_signal(),
        |session: &Session| {
            for line in session.banner_lines() {
                println!("{line}");
            }
        },
    )
    .await
    .context("shell session failed")?;
    Ok(code)
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing(DEFAULT_DIRECTIVE);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    let code = rt.block_on(async {
        match run().await {
            Ok(code) => code,
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "webshell exited");
                eprintln!("error: {err:#}");
                1
            }
        }
    });
    // Blocking stdin reads would otherwise hold the runtime open.
    rt.shutdown_background();
    ExitCode::from(code)
}
