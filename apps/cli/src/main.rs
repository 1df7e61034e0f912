use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use sqlquill_core_sdk::{
    chat::ChatService,
    config::AppConfig,
    connectivity::{ConnectionParams, ConnectivityTester},
    db::SqliteSecretStore,
    executor::{PgExecutor, QueryExecutor},
    generation::QueryGenerationService,
    history::{FileStorage, QueryHistory, QueryHistoryItem},
    llm::Dispatcher,
    models::{ProviderConfig, ProviderId},
    server,
    settings::SettingsStore,
    telemetry,
};

/** \brief 命令行使用的设置作用域。 */
const CLI_SCOPE: &str = "local";

/**
 * \brief CLI 程序入口。
 */
#[derive(Parser, Debug)]
#[command(name = "sqlquill", version, about = "Natural-language to SQL assistant")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /** \brief 查看、修改或检测已保存的 Provider 设置。 */
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /**
     * \brief 将问题转换为 SQL，并写入本地历史。
     * \param schema 可选的数据库 schema 文件（DDL）
     */
    Generate {
        #[arg(long)]
        prompt: String,
        #[arg(long = "schema-file")]
        schema: Option<std::path::PathBuf>,
    },

    /** \brief 分析 schema 文件中的表与关系。 */
    Analyze {
        #[arg(long = "schema-file")]
        schema: std::path::PathBuf,
    },

    /** \brief 为 schema 文件推荐业务问题。 */
    Suggest {
        #[arg(long = "schema-file")]
        schema: std::path::PathBuf,
    },

    /** \brief 在 DATABASE_URL 上执行 SQL，可直接给出或引用历史记录 id。 */
    Execute {
        #[arg(long, conflicts_with = "history_id")]
        sql: Option<String>,
        #[arg(long)]
        history_id: Option<String>,
    },

    /** \brief 向 BI 助手提问，默认使用已保存的当前 Provider。 */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },

    /** \brief 查看本地查询历史。 */
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /** \brief 启动本地 HTTP 服务并提供前端页面。 */
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Show,
    Set {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        custom_model: Option<String>,
    },
    /** \brief 用当前 Provider 发送一条简短的探测消息。 */
    Test,
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
    List {
        #[arg(long)]
        search: Option<String>,
    },
    Show {
        id: String,
    },
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    telemetry::set_log_dir(config.log_dir.clone());
    telemetry::set_enabled(config.telemetry_enabled);

    match cli.command {
        Commands::Settings { action } => run_settings(&config, action).await?,
        Commands::Generate { prompt, schema } => {
            let schema = schema.map(read_schema).transpose()?;
            let generator = QueryGenerationService::new(dispatcher(&config)?, &config);
            let response = generator.generate(&prompt, schema.as_deref()).await?;

            let mut history = QueryHistory::load(FileStorage::new(&config.history_path));
            let item = QueryHistoryItem::new(&prompt, &response);
            let id = item.id.clone();
            history.append(item).context("save history failed")?;

            println!("{}\n", response.sql_query);
            println!("{}", response.explanation);
            println!("\n(history id={})", id);
        }
        Commands::Analyze { schema } => {
            let schema = read_schema(schema)?;
            let generator = QueryGenerationService::new(dispatcher(&config)?, &config);
            let analysis = generator.analyze_schema(&schema).await?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Suggest { schema } => {
            let schema = read_schema(schema)?;
            let generator = QueryGenerationService::new(dispatcher(&config)?, &config);
            for (i, q) in generator.suggest_queries(&schema).await?.iter().enumerate() {
                println!("{}. {}", i + 1, q);
            }
        }
        Commands::Execute { sql, history_id } => {
            let sql = match (sql, history_id) {
                (Some(sql), _) => sql,
                (None, Some(id)) => {
                    let history = QueryHistory::load(FileStorage::new(&config.history_path));
                    history
                        .get(&id)
                        .map(|item| item.sql_query.clone())
                        .with_context(|| format!("no history entry with id={}", id))?
                }
                (None, None) => bail!("pass --sql or --history-id"),
            };
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is not set")?;
            let executor = PgExecutor::connect_lazy(url)?;
            let rows = executor.execute(&sql).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            println!("({} rows)", rows.len());
        }
        Commands::Chat {
            prompt,
            provider,
            model,
        } => {
            let settings = settings_store(&config)?.load_or_default(CLI_SCOPE);
            let provider = provider.unwrap_or_else(|| settings.active_provider.as_str().to_string());
            let model = model.unwrap_or_else(|| {
                provider
                    .parse::<ProviderId>()
                    .map(|id| settings.model(id).to_string())
                    .unwrap_or_default()
            });
            telemetry::log_event(
                "cli.chat",
                &format!("provider={} prompt_len={}", provider, prompt.len()),
            );
            let chat = ChatService::new(dispatcher(&config)?, &config);
            let reply = chat.respond(&settings, &prompt, &provider, &model).await?;
            println!("{}", reply.text);
        }
        Commands::History { action } => {
            let mut history = QueryHistory::load(FileStorage::new(&config.history_path));
            match action {
                HistoryAction::List { search } => {
                    let items = history.search(search.as_deref().unwrap_or(""));
                    if items.is_empty() {
                        println!("No queries in history.");
                    }
                    for item in items {
                        println!(
                            "{}  {}  {}",
                            item.id,
                            item.timestamp.date(),
                            item.prompt
                        );
                        if !item.summary.is_empty() {
                            println!("    {}", item.summary);
                        }
                    }
                }
                HistoryAction::Show { id } => {
                    let form = history
                        .select(&id)
                        .with_context(|| format!("no history entry with id={}", id))?;
                    println!("Prompt: {}\n", form.prompt);
                    println!("{}\n", form.sql_query);
                    println!("{}", form.explanation);
                }
                HistoryAction::Clear => {
                    history.clear().context("clear history failed")?;
                    println!("History cleared");
                }
            }
        }
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                config.addr = addr;
            }
            server::run(config).await?;
        }
    }

    Ok(())
}

async fn run_settings(config: &AppConfig, action: SettingsAction) -> Result<()> {
    let store = settings_store(config)?;
    match action {
        SettingsAction::Show => {
            let mut settings = store.load_or_default(CLI_SCOPE);
            for key in settings.api_keys.values_mut() {
                *key = mask(key);
            }
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SettingsAction::Set {
            provider,
            api_key,
            model,
            endpoint,
            custom_model,
        } => {
            let id: ProviderId = provider.parse()?;
            let mut settings: ProviderConfig = store.load_or_default(CLI_SCOPE);
            settings.active_provider = id;
            if let Some(key) = api_key {
                settings.api_keys.insert(id, key);
            }
            if let Some(model) = model {
                settings.selected_models.insert(id, model);
            }
            if let Some(endpoint) = endpoint {
                settings.custom_endpoint = endpoint;
            }
            if let Some(custom_model) = custom_model {
                settings.custom_model = custom_model;
            }
            settings.normalize();
            if let Err(msg) = settings.validate_for_save() {
                bail!(msg);
            }
            store.save(CLI_SCOPE, &settings)?;
            println!("Saved settings (active provider={})", id.display_name());
        }
        SettingsAction::Test => {
            let settings = store.load_or_default(CLI_SCOPE);
            let tester = ConnectivityTester::new(dispatcher(config)?);
            let result = tester.test(&ConnectionParams::from_config(&settings)).await;
            println!("{}", result.message);
            if !result.success {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn dispatcher(config: &AppConfig) -> Result<Arc<Dispatcher>> {
    Ok(Arc::new(Dispatcher::new(config.request_timeout)?))
}

fn settings_store(config: &AppConfig) -> Result<SettingsStore> {
    let store = SqliteSecretStore::open(&config.db_path).context("open settings database failed")?;
    Ok(SettingsStore::new(Arc::new(store)))
}

fn read_schema(path: std::path::PathBuf) -> Result<String> {
    std::fs::read_to_string(&path).with_context(|| format!("read schema {}", path.display()))
}

fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}
