use std::time::Duration;

use unitrelay::{ActionRequest, CancelScope, JobMode, RunConfig, TunnelConfig, UnitAction};

fn main() {
    let host = std::env::args().nth(1).unwrap_or_else(|| "localhost".to_string());
    if let Err(e) = smol::block_on(run(host)) {
        eprintln!("{e}");
        std::process::exit(if e.is_setup_failure() { 1 } else { 2 });
    }
}

async fn run(host: String) -> Result<(), unitrelay::Error> {
    let mut tunnel = TunnelConfig::new(host);
    tunnel.ready_timeout = Duration::from_secs(15);

    let request = ActionRequest::new(["nginx*", "redis"])
        .matching(true)
        .with_action(UnitAction::Restart)
        .with_mode(JobMode::Replace)
        .with_job_timeout(Some(Duration::from_secs(60)));

    let completed = unitrelay::run(&CancelScope::new(), &RunConfig::new(tunnel, request)).await?;
    for done in completed {
        println!("{}: job {} {}", done.unit, done.job_id, done.result);
    }
    Ok(())
}
