use std::process::ExitCode;
use std::sync::Arc;

use serde_json::Value;

use tasker::modules::{LocalResolver, builtin};
use tasker::{ModuleRegistry, RemoteResolver, SchemeResolver, Task, Tasker, TaskerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(module), Some(export)) = (args.next(), args.next()) else {
        eprintln!("Usage: tasker <module-reference> <export> [json-arg ...]");
        eprintln!("  tasker std/math add 2 3");
        eprintln!("  tasker https://modules.example.com/geo distance '[0,0]' '[3,4]'");
        return Ok(ExitCode::from(2));
    };

    // Arguments that are not valid JSON are passed as strings.
    let parameters: Vec<Value> = args
        .map(|arg| serde_json::from_str(&arg).unwrap_or(Value::String(arg)))
        .collect();

    let config = TaskerConfig::from_env()?;

    let registry = Arc::new(ModuleRegistry::new(config.base_dir.clone()));
    builtin::register(&registry);

    let resolver = SchemeResolver::new()
        .with_local(Arc::new(LocalResolver::new(registry)))
        .with_remote(Arc::new(RemoteResolver::new()?));

    let tasker = Tasker::start(config, Arc::new(resolver))?;

    let code = match tasker.call(Task::new(module, export).args(parameters)).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", serde_json::to_string_pretty(&e.record)?);
            ExitCode::FAILURE
        }
    };

    tasker.shutdown().await?;
    Ok(code)
}
