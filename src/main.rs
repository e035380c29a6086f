use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use flexrun::engine::{FlexExecutionEngine, ScriptedRuntime};
use flexrun::models::{CapabilityRegistration, EventSink, FlexEvent, TaskEnvelope};
use flexrun::planner::{FlexPlanner, PlanDraft, ScriptedPlanner};
use flexrun::registry::{CapabilityRegistry, MemoryCapabilityStore};
use flexrun::{
    FacetCatalog, FlexConfig, FlexRunService, MemoryHitlService, MemoryPersistence, RunOutcome,
};

#[derive(Parser)]
#[command(name = "flexrun", about = "Flexible AI-agent workflow orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task envelope against scripted capabilities, streaming events.
    Run {
        /// Task envelope (YAML or JSON).
        #[arg(long)]
        envelope: PathBuf,
        /// Capability registrations to load (YAML or JSON list).
        #[arg(long)]
        capabilities: PathBuf,
        /// Plan draft the scripted planner returns (YAML or JSON).
        #[arg(long)]
        plan: PathBuf,
        /// Scripted capability outputs: map of capabilityId to output list.
        #[arg(long)]
        outputs: PathBuf,
    },
    /// Validate an envelope: condition DSLs, contract facets, input shapes.
    Check {
        /// Task envelope (YAML or JSON).
        #[arg(long)]
        envelope: PathBuf,
    },
    /// List the built-in facet catalog.
    Catalog,
}

struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: FlexEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(err) => eprintln!("event serialization failed: {}", err),
        }
    }
}

fn load<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {} file {:?}", what, path))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {} file {:?}", what, path))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = FlexConfig::from_env();

    match cli.command {
        Command::Run {
            envelope,
            capabilities,
            plan,
            outputs,
        } => run_envelope(&config, &envelope, &capabilities, &plan, &outputs).await,
        Command::Check { envelope } => check_envelope(&envelope),
        Command::Catalog => {
            let catalog = FacetCatalog::with_defaults();
            for name in catalog.names() {
                let def = catalog.get(&name).expect("listed name resolves");
                println!("{:<18} {:<12} {}", def.name, format!("{:?}", def.direction), def.title);
            }
            Ok(())
        }
    }
}

async fn run_envelope(
    config: &FlexConfig,
    envelope_path: &Path,
    capabilities_path: &Path,
    plan_path: &Path,
    outputs_path: &Path,
) -> Result<()> {
    let envelope: TaskEnvelope = load(envelope_path, "envelope")?;
    let registrations: Vec<CapabilityRegistration> = load(capabilities_path, "capabilities")?;
    let draft: PlanDraft = load(plan_path, "plan")?;
    let outputs: BTreeMap<String, Vec<Value>> = load(outputs_path, "outputs")?;

    let catalog = Arc::new(FacetCatalog::with_defaults());
    let registry = Arc::new(CapabilityRegistry::new(
        MemoryCapabilityStore::shared(),
        catalog,
        config,
    ));
    for registration in registrations {
        let record = registry
            .register(registration)
            .await
            .map_err(|err| anyhow::anyhow!("registration rejected ({}): {}", err.code(), err))?;
        eprintln!("registered capability {} v{}", record.capability_id, record.version);
    }

    let runtime = Arc::new(ScriptedRuntime::new());
    for (capability_id, values) in outputs {
        runtime.enqueue(&capability_id, values);
    }
    let persistence = MemoryPersistence::shared();
    let hitl = MemoryHitlService::shared(config.hitl_max_requests);
    let planner_service = Arc::new(ScriptedPlanner::single(draft));

    let service = FlexRunService::new(
        registry.clone(),
        FlexPlanner::new(registry.clone(), planner_service),
        FlexExecutionEngine::new(
            registry.clone(),
            persistence.clone(),
            hitl.clone(),
            runtime,
            config.clone(),
        ),
        persistence,
        hitl,
        config.clone(),
    );

    match service.run(envelope, &StdoutSink).await {
        Ok(RunOutcome::Completed { run_id, output, .. }) => {
            eprintln!("run {} completed", run_id);
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Ok(RunOutcome::Paused {
            run_id,
            status,
            pending_request_id,
            awaiting_node_id,
        }) => {
            eprintln!(
                "run {} paused ({:?}); pending request: {:?}, awaiting node: {:?}",
                run_id, status, pending_request_id, awaiting_node_id
            );
            Ok(())
        }
        Err(err) => bail!("run failed ({}): {}", err.code(), err),
    }
}

fn check_envelope(envelope_path: &Path) -> Result<()> {
    let mut envelope: TaskEnvelope = load(envelope_path, "envelope")?;
    envelope
        .normalize_conditions()
        .map_err(|err| anyhow::anyhow!("invalid_condition_dsl: {}", err))?;

    for policy in &envelope.policies.runtime {
        if let Some(condition) = &policy.trigger.condition
            && let Some(canonical) = &condition.canonical_dsl
        {
            println!("policy {:<16} {}", policy.id, canonical);
        }
    }
    for goal in &envelope.goal_condition {
        match &goal.condition {
            Some(condition) => println!(
                "goal   {:<16} {}",
                goal.facet,
                condition.canonical_dsl.as_deref().unwrap_or(&condition.dsl)
            ),
            None => println!("goal   {:<16} (presence check)", goal.facet),
        }
    }

    let catalog = FacetCatalog::with_defaults();
    for facet in envelope.output_contract.facet_names() {
        if !catalog.contains(&facet) {
            bail!("output contract references unknown facet '{}'", facet);
        }
    }
    println!("envelope ok");
    Ok(())
}
