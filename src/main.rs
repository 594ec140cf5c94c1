use std::path::{Path, PathBuf};

use model_ci::az::Az;
use model_ci::config;
use model_ci::deploy::{self, DeployConfig};
use model_ci::github::{self, GitHubClient};
use model_ci::models::{self, HubClient, HubQuery, ModelSource, RegistrySource, SourceMode};
use model_ci::queue::{self, QueueRunConfig};
use model_ci::registration::{self, ImportConfig, ImportOutcome};
use model_ci::setup;
use model_ci::status;
use model_ci::utils::{self, SummaryRow};
use model_ci::workflow::{self, CatalogGenerator, CatalogTemplates};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "model-ci",
    about = "Queue, generate, deploy and report CI tests for registry-hosted models",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum HistoryMode {
    /// Fetch runs from the GitHub Actions API
    Api,
    /// Read runs from a JSON dump
    File,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Assign models to workspace queues and write queue + workflow files
    CreateQueue {
        /// Where the model list comes from
        #[arg(long, value_enum, default_value_t = SourceMode::File)]
        mode: SourceMode,
        /// Registry to list models from and to record in queue files
        #[arg(long, default_value = "HuggingFace")]
        registry_name: String,
        /// Workflow output directory; files with the same name are overwritten
        #[arg(long, default_value = ".github/workflows")]
        workflow_dir: PathBuf,
        #[arg(long, default_value = "tests/config/queue")]
        queue_dir: PathBuf,
        /// Queue set name; existing queue files in this set are replaced
        #[arg(long, default_value = "huggingface-rerun")]
        test_set: String,
        /// One model per line, or a JSON array when the file ends in .json
        #[arg(long, default_value = "tests/config/rerun.txt")]
        model_list_file: PathBuf,
        #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
        test_keep_looping: bool,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        test_trigger_next_model: bool,
        #[arg(long, default_value = "cpu")]
        test_sku_type: String,
        /// Parallel queues per workspace
        #[arg(long, default_value_t = 3)]
        parallel_tests: usize,
        #[arg(long, default_value = "tests/config/workflow-template-huggingface.yml")]
        workflow_template: PathBuf,
        #[arg(long, default_value = "tests/config/workspaces.json")]
        workspace_list: PathBuf,
        /// Prefix for generated workflow file names
        #[arg(long, default_value = "")]
        workflow_prefix: String,
        /// Hub task to query in hub mode
        #[arg(long, default_value = "fill-mask")]
        hub_task: String,
        #[arg(long, default_value = "downloads")]
        hub_sort: String,
        #[arg(long, default_value_t = 10)]
        hub_limit: usize,
        #[arg(long, default_value = "tests/logs")]
        log_dir: PathBuf,
        /// Print planned actions without writing files
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Generate inference, evaluation and finetuning workflows from a model catalog
    CreateWorkflows {
        /// Catalog JSON with model_name, model_version, task, finetuning_tasks
        #[arg(long, conflicts_with_all = ["model_list_file", "models_dir"])]
        catalog: Option<PathBuf>,
        /// Model ids to resolve from the registry
        #[arg(long)]
        model_list_file: Option<PathBuf>,
        /// Asset directory with one sub-directory per model id
        #[arg(long)]
        models_dir: Option<PathBuf>,
        #[arg(long, default_value = "azureml")]
        registry_name: String,
        #[arg(long, default_value = "workflow_templates")]
        template_dir: PathBuf,
        #[arg(long, default_value = ".github/workflows")]
        output_dir: PathBuf,
        /// Delete workflows with this prefix before generating
        #[arg(long)]
        remove_prefix: Option<String>,
        /// Write a task/model/badge table to this file
        #[arg(long)]
        readme: Option<PathBuf>,
        #[arg(long, default_value = "Azure/azureml-examples")]
        repo: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Aggregate run history into a markdown status dashboard
    Status {
        #[arg(long, value_enum, default_value_t = HistoryMode::Api)]
        mode: HistoryMode,
        #[arg(long)]
        model_list_file: PathBuf,
        /// Run history JSON (file mode)
        #[arg(long, required_if_eq("mode", "file"))]
        runs_file: Option<PathBuf>,
        #[arg(long, default_value = "Azure/azureml-oss-models")]
        repo: String,
        #[arg(long, default_value = "dashboard/HuggingFace/README.md")]
        markdown_file: PathBuf,
        #[arg(long, default_value = "")]
        workflow_prefix: String,
        #[arg(long, default_value = "tests/logs")]
        log_dir: PathBuf,
    },
    /// Write a plain badge page for a model list
    Badge {
        #[arg(long)]
        model_list_file: PathBuf,
        #[arg(long, default_value = "dashboard/HuggingFace/README.md")]
        markdown_file: PathBuf,
        #[arg(long, default_value = "Azure/azureml-oss-models")]
        repo: String,
        #[arg(long, default_value = "")]
        workflow_prefix: String,
    },
    /// Emit the model that follows the current one in its queue
    NextModel {
        #[arg(long, env = "test_model_name")]
        model: String,
        #[arg(long, env = "test_queue")]
        queue: String,
        #[arg(long, env = "test_set")]
        test_set: String,
        #[arg(long, env = "test_keep_looping", default_value_t = false, action = clap::ArgAction::Set)]
        keep_looping: bool,
        #[arg(long, default_value = "tests/config/queue")]
        queue_dir: PathBuf,
        #[arg(long, env = "GITHUB_OUTPUT")]
        github_output: Option<PathBuf>,
    },
    /// Deploy the latest model version to an online endpoint and score a sample
    Deploy {
        #[arg(long, env = "test_model_name")]
        model: String,
        #[arg(long, env = "test_sku_type")]
        sku_type: String,
        #[arg(long, env = "test_queue")]
        queue: String,
        #[arg(long, env = "test_set")]
        test_set: String,
        #[arg(long, env = "test_trigger_next_model", default_value_t = true, action = clap::ArgAction::Set)]
        trigger_next_model: bool,
        #[arg(long, env = "test_keep_looping", default_value_t = false, action = clap::ArgAction::Set)]
        keep_looping: bool,
        #[arg(long, default_value = "tests/config/queue")]
        queue_dir: PathBuf,
        #[arg(long, default_value = "tests/config/sku-override")]
        sku_override_dir: PathBuf,
        #[arg(long, default_value = "tests/config/sample_inputs")]
        sample_dir: PathBuf,
        #[arg(long, default_value = "tests/config/errors.json")]
        errors_file: PathBuf,
        #[arg(long, default_value_t = 1)]
        instance_count: u32,
        #[arg(long, env = "GITHUB_OUTPUT")]
        github_output: Option<PathBuf>,
        #[arg(long, env = "GITHUB_STEP_SUMMARY")]
        step_summary: Option<PathBuf>,
    },
    /// Import a hub model into its queue's workspace through the import pipeline
    ImportModel {
        #[arg(long, env = "test_model_name")]
        model: String,
        /// Hub task; looked up on the hub when omitted
        #[arg(long)]
        task: Option<String>,
        #[arg(long, env = "test_queue")]
        queue: String,
        #[arg(long, env = "test_set")]
        test_set: String,
        #[arg(long, env = "test_trigger_next_model", default_value_t = true, action = clap::ArgAction::Set)]
        trigger_next_model: bool,
        #[arg(long, env = "test_keep_looping", default_value_t = false, action = clap::ArgAction::Set)]
        keep_looping: bool,
        #[arg(long, default_value = "tests/config/queue")]
        queue_dir: PathBuf,
        /// Registry publishing the import component
        #[arg(long, default_value = "azureml")]
        component_registry: String,
        /// Default compute for the pipeline job
        #[arg(long)]
        compute: Option<String>,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        update_existing_model: bool,
        /// Stop with a notice when the model is already registered
        #[arg(long, default_value_t = false)]
        skip_existing: bool,
        #[arg(long, default_value = "pipeline_outputs")]
        download_dir: PathBuf,
        #[arg(long, env = "GITHUB_OUTPUT")]
        github_output: Option<PathBuf>,
        #[arg(long, env = "GITHUB_STEP_SUMMARY")]
        step_summary: Option<PathBuf>,
    },
    /// Create the workspaces in the workspace list that do not exist yet
    CreateWorkspaces {
        #[arg(long, default_value = "tests/config/workspaces.json")]
        workspace_list: PathBuf,
        /// Report missing workspaces without creating them
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn write_markdown(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "wrote markdown");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Commands::CreateQueue {
            mode,
            registry_name,
            workflow_dir,
            queue_dir,
            test_set,
            model_list_file,
            test_keep_looping,
            test_trigger_next_model,
            test_sku_type,
            parallel_tests,
            workflow_template,
            workspace_list,
            workflow_prefix,
            hub_task,
            hub_sort,
            hub_limit,
            log_dir,
            dry_run,
        } => {
            let config = QueueRunConfig {
                registry: registry_name.clone(),
                workflow_dir,
                queue_dir,
                test_set,
                keep_looping: test_keep_looping,
                trigger_next_model: test_trigger_next_model,
                sku_type: test_sku_type,
                parallel_tests,
                workflow_template,
                workflow_prefix,
                log_dir: Some(log_dir),
                dry_run,
            };
            config.validate()?;
            info!(?mode, test_set = %config.test_set, dry_run, "starting create-queue");

            let source = match mode {
                SourceMode::File => ModelSource::File(model_list_file),
                SourceMode::Registry => ModelSource::Registry { name: registry_name },
                SourceMode::Hub => ModelSource::Hub(HubQuery {
                    task: hub_task,
                    sort: hub_sort,
                    limit: hub_limit,
                }),
            };
            let az = Az::default();
            if mode == SourceMode::Registry {
                az.ensure_available()?;
            }
            let models = models::resolve_models(&source, &az, config.log_dir.as_deref())?;
            let workspaces = config::load_workspace_list(&workspace_list)?;

            let report = queue::create_queues(&config, &models, &workspaces)?;
            utils::print_summary(
                "Summary",
                &[
                    SummaryRow::new("Models", report.models),
                    SummaryRow::new("Workspaces", report.workspaces),
                    SummaryRow::new("Parallel tests", report.parallel_tests),
                    SummaryRow::new("Total queues", report.total_slots()),
                    SummaryRow::new("Queues with models", report.queues),
                    SummaryRow::new("Average models per queue", report.average_per_queue()),
                    SummaryRow::new("Workflow files", report.workflow_files.len()),
                ],
            );
            if dry_run {
                info!("dry-run completed; no files written");
            }
        }
        Commands::CreateWorkflows {
            catalog,
            model_list_file,
            models_dir,
            registry_name,
            template_dir,
            output_dir,
            remove_prefix,
            readme,
            repo,
            dry_run,
        } => {
            let templates = CatalogTemplates::load(&template_dir)?;
            let entries = match (catalog, model_list_file, models_dir) {
                (Some(path), _, _) => workflow::load_catalog(&path)?,
                (None, list, dir) => {
                    let ids = match (list, dir) {
                        (Some(list), _) => models::load_model_list_file(&list)?,
                        (None, Some(dir)) => workflow::model_ids_from_dir(&dir)?,
                        (None, None) => {
                            return Err(anyhow!(
                                "no models provided; pass --catalog, --model-list-file, or --models-dir"
                            ));
                        }
                    };
                    let az = Az::default();
                    az.ensure_available()?;
                    workflow::catalog_from_registry(&RegistrySource::new(&az, registry_name), &ids)
                }
            };
            if entries.is_empty() {
                warn!("catalog is empty; nothing to generate");
            }

            if let Some(prefix) = &remove_prefix
                && !dry_run
                && output_dir.is_dir()
            {
                workflow::remove_existing_workflows(&output_dir, prefix)?;
            }
            let report = CatalogGenerator::new(&templates, &output_dir, dry_run).generate(&entries)?;
            if let Some(readme) = readme {
                let table = workflow::render_catalog_readme(&entries, &repo);
                if dry_run {
                    info!(path = %readme.display(), "dry-run: would write readme");
                } else {
                    write_markdown(&readme, &table)?;
                }
            }
            utils::print_summary(
                "Summary",
                &[
                    SummaryRow::new("Models", entries.len()),
                    SummaryRow::new("Workflow files", report.written.len()),
                    SummaryRow::new("Skipped", report.skipped.len()),
                ],
            );
        }
        Commands::Status {
            mode,
            model_list_file,
            runs_file,
            repo,
            markdown_file,
            workflow_prefix,
            log_dir,
        } => {
            info!(?mode, "starting status");
            let runs = match mode {
                HistoryMode::Api => {
                    let client = GitHubClient::new(github::API_ROOT, github::github_token()?)?;
                    let runs = client.list_runs(&repo)?;
                    utils::dump_json_log(&log_dir, "get_github_workflows", "", &runs)?;
                    runs
                }
                HistoryMode::File => {
                    let path = runs_file.context("--runs-file is required in file mode")?;
                    status::load_runs_file(&path)?
                }
            };
            let models = models::load_model_list_file(&model_list_file)?;
            let report = status::calculate_test_status(&runs, &models, &workflow_prefix);
            let summary = status::summarize_test_status(&report);
            let dashboard = status::render_dashboard(&report, &summary, &repo, &workflow_prefix);
            write_markdown(&markdown_file, &dashboard)?;

            let mut rows = vec![SummaryRow::new("Total", summary.total)];
            for outcome in status::Outcome::ALL {
                rows.push(SummaryRow::new(
                    outcome.label(),
                    format!("{} ({:.1}%)", summary.count(outcome), summary.percent(outcome)),
                ));
            }
            rows.push(SummaryRow::new("Total duration", status::format_duration(summary.total_duration_minutes)));
            rows.push(SummaryRow::new("Clock duration", status::format_duration(summary.clock_minutes)));
            utils::print_summary("Test status", &rows);
        }
        Commands::Badge {
            model_list_file,
            markdown_file,
            repo,
            workflow_prefix,
        } => {
            let models = models::load_model_list_file(&model_list_file)?;
            let page = status::render_badge_page(&models, &repo, &workflow_prefix);
            write_markdown(&markdown_file, &page)?;
        }
        Commands::NextModel {
            model,
            queue,
            test_set,
            keep_looping,
            queue_dir,
            github_output,
        } => {
            let queue_file = queue::read_queue_file(&queue_dir, &test_set, &queue)?;
            deploy::set_next_model(&queue_file, &model, keep_looping, github_output.as_deref())?;
        }
        Commands::Deploy {
            model,
            sku_type,
            queue,
            test_set,
            trigger_next_model,
            keep_looping,
            queue_dir,
            sku_override_dir,
            sample_dir,
            errors_file,
            instance_count,
            github_output,
            step_summary,
        } => {
            let config = DeployConfig {
                model,
                sku_type,
                queue,
                test_set,
                trigger_next_model,
                keep_looping,
                queue_dir,
                sku_override_dir,
                sample_dir,
                errors_file,
                github_output,
                step_summary,
                instance_count,
            };
            deploy::run_deploy(&config, &Az::default())?;
            info!(model = %config.model, "deployment test completed");
        }
        Commands::ImportModel {
            model,
            task,
            queue,
            test_set,
            trigger_next_model,
            keep_looping,
            queue_dir,
            component_registry,
            compute,
            update_existing_model,
            skip_existing,
            download_dir,
            github_output,
            step_summary,
        } => {
            let config = ImportConfig {
                model,
                task,
                queue,
                test_set,
                queue_dir,
                component_registry,
                compute,
                update_existing_model,
                skip_existing,
                download_dir,
                trigger_next_model,
                keep_looping,
                github_output,
                step_summary,
            };
            let outcome = registration::run_import(&config, &Az::default(), |model_id| {
                HubClient::new(models::HUB_ENDPOINT, std::env::var("HF_TOKEN").ok())?.model_task(model_id)
            })?;
            match outcome {
                ImportOutcome::AlreadyRegistered { name, version } => {
                    info!(model = %name, %version, "import skipped");
                }
                ImportOutcome::Registered(registered) => {
                    utils::print_summary(
                        "Registered model",
                        &[
                            SummaryRow::new("Name", &registered.name),
                            SummaryRow::new("Version", registered.version.as_deref().unwrap_or("-")),
                            SummaryRow::new("Task", registered.task().unwrap_or("-")),
                        ],
                    );
                }
            }
        }
        Commands::CreateWorkspaces { workspace_list, dry_run } => {
            let workspaces = config::load_workspace_list(&workspace_list)?;
            let report = setup::ensure_workspaces(&Az::default(), &workspaces, dry_run)?;
            utils::print_summary(
                "Workspaces",
                &[
                    SummaryRow::new("Existing", report.existing.len()),
                    SummaryRow::new("Created", report.created.len()),
                    SummaryRow::new("Missing (dry run)", report.planned.join(", ")),
                ],
            );
        }
    }

    Ok(())
}
