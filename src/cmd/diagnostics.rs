//! Diagnostics command - checks the environment the orchestrator needs

use anyhow::Result;

use kromosynth_orchestrator::config::Configuration;

/// Run environment diagnostics and print findings
pub async fn run(config_path: &str) -> Result<()> {
    println!("Kromosynth Orchestrator diagnostics");
    println!("===================================");

    let config = match Configuration::load(config_path) {
        Ok(config) => {
            println!("[ok] configuration parsed: {}", config_path);
            config
        }
        Err(e) => {
            println!("[!!] cannot load configuration {}: {}", config_path, e);
            return Ok(());
        }
    };

    check_dir("working directory", &config.system.working_directory);
    check_dir("log directory", &config.system.log_directory);

    check_file("compute CLI script", &config.runtime.cli_script);
    check_file("services directory", &config.runtime.services_dir);

    check_tool("node interpreter", &config.runtime.node_path).await;
    check_tool("python interpreter", &config.runtime.python_path).await;

    if config.sync.enabled {
        check_tool("binary-sync tool", &config.sync.db_tool).await;
        match &config.sync.service_url {
            Some(url) => check_central(url, config.sync.api_key.as_deref()).await,
            None => println!("[--] no central sync service configured"),
        }
    } else {
        println!("[--] sync disabled");
    }

    Ok(())
}

fn check_dir(label: &str, path: &std::path::Path) {
    if path.is_dir() {
        println!("[ok] {}: {}", label, path.display());
    } else {
        println!("[!!] {} missing: {}", label, path.display());
    }
}

fn check_file(label: &str, path: &std::path::Path) {
    if path.exists() {
        println!("[ok] {}: {}", label, path.display());
    } else {
        println!("[!!] {} missing: {}", label, path.display());
    }
}

async fn check_tool(label: &str, tool: &str) {
    let result = tokio::process::Command::new(tool)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;

    match result {
        Ok(status) if status.success() => println!("[ok] {}: {}", label, tool),
        Ok(status) => println!("[!!] {} ({}) exited with {}", label, tool, status),
        Err(e) => println!("[!!] {} ({}) not runnable: {}", label, tool, e),
    }
}

async fn check_central(url: &str, api_key: Option<&str>) {
    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            println!("[!!] cannot build HTTP client: {}", e);
            return;
        }
    };

    let mut request = client.get(url);
    if let Some(key) = api_key {
        request = request.header("X-Sync-API-Key", key);
    }

    match request.send().await {
        Ok(response) => println!("[ok] central service reachable: {} ({})", url, response.status()),
        Err(e) => println!("[!!] central service unreachable: {}", e),
    }
}
