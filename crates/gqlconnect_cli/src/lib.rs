//! Command-line interface for gqlconnect.
//!
//! # Usage
//!
//! ```bash
//! # Read rows
//! gqlconnect --endpoint http://localhost:8080/v1/graphql \
//!     get users --select id,name --where '{"role": {"_eq": "admin"}}' --limit 10
//!
//! # Print the document instead of sending it
//! gqlconnect get users --select id --order-by created_at:desc --dry-run
//!
//! # Write
//! gqlconnect --config gqlconnect.json insert users --data '{"name": "Ada"}' --returning id
//! gqlconnect --config gqlconnect.json delete users --where '{"id": {"_eq": 1}}'
//!
//! # Several writes in one request
//! gqlconnect --config gqlconnect.json batch ops.json
//!
//! # Stream events until interrupted
//! gqlconnect --config gqlconnect.json subscribe 'subscription { messages { id body } }'
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;
use gqlconnect_core::{
    batch_document, delete_document, insert_document, query_document, update_document,
    Aggregate, BatchOperation, DeleteArgs, Filter, InsertArgs, OnConflict, OrderBy, QueryArgs,
    Returning, Selection, UpdateArgs, Value,
};
use gqlconnect_sdk::{
    create_connector, Connector, ConnectError, ConnectResult, ConnectorConfig, ErrorCode,
    OriginSettings, ResultExt, SubscriptionEvent, SubscriptionHandlers,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "gqlconnect")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Connector configuration file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// GraphQL endpoint, overrides the config file
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// WebSocket endpoint for subscriptions, overrides the config file
    #[arg(long, global = true)]
    pub streaming_endpoint: Option<String>,

    /// Extra request header as `name:value`
    #[arg(short = 'H', long = "header", global = true, value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Bearer token to send with every request
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Log documents, variables and results
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a raw query document
    Query {
        /// Document text, or `@path` to read it from a file
        document: String,

        /// Variables as a JSON object
        #[arg(long)]
        variables: Option<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Run a raw mutation document
    Mutate {
        /// Document text, or `@path` to read it from a file
        document: String,

        /// Variables as a JSON object
        #[arg(long)]
        variables: Option<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Subscribe and print every event
    Subscribe {
        /// Document text, or `@path` to read it from a file
        document: String,

        /// Variables as a JSON object
        #[arg(long)]
        variables: Option<String>,

        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<usize>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Read rows from a table
    Get {
        table: String,

        /// Fields to select, comma separated
        #[arg(long, value_delimiter = ',')]
        select: Vec<String>,

        /// Filter as a JSON object
        #[arg(long = "where")]
        filter: Option<String>,

        #[arg(long)]
        limit: Option<u64>,

        #[arg(long)]
        offset: Option<u64>,

        /// `field` or `field:direction`; repeat for multi-column ordering
        #[arg(long = "order-by")]
        order_by: Vec<String>,

        /// Also fetch the row count
        #[arg(long)]
        count: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// Insert one object or an array of objects
    Insert {
        table: String,

        /// Object or array of objects as JSON
        #[arg(long)]
        data: String,

        /// Upsert on this constraint
        #[arg(long)]
        on_conflict: Option<String>,

        /// Columns to update on conflict, comma separated
        #[arg(long, value_delimiter = ',')]
        update_columns: Vec<String>,

        /// Fields to return, comma separated
        #[arg(long, value_delimiter = ',')]
        returning: Vec<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Update rows matching a filter
    Update {
        table: String,

        /// Patch as a JSON object
        #[arg(long = "set")]
        patch: String,

        /// Filter as a JSON object
        #[arg(long = "where")]
        filter: String,

        #[arg(long, value_delimiter = ',')]
        returning: Vec<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Delete rows matching a filter
    Delete {
        table: String,

        /// Filter as a JSON object
        #[arg(long = "where")]
        filter: String,

        #[arg(long, value_delimiter = ',')]
        returning: Vec<String>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Run a JSON array of insert/update/delete operations in one request
    Batch {
        /// File holding the operations
        file: PathBuf,

        #[arg(long)]
        dry_run: bool,
    },
}

/// Parses `name:value`.
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected `name:value`, got `{}`", raw)),
    }
}

fn parse_json(raw: &str, what: &str) -> ConnectResult<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| ConnectError::validation(format!("invalid {}: {}", what, e)))
}

fn parse_variables(raw: Option<&str>) -> ConnectResult<Option<serde_json::Value>> {
    raw.map(|raw| parse_json(raw, "variables")).transpose()
}

/// Document text, read from a file when prefixed with `@`.
fn read_document(raw: &str) -> ConnectResult<String> {
    match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_connect_err_with(ErrorCode::Validation, format!("cannot read {}", path)),
        None => Ok(raw.to_string()),
    }
}

fn returning(fields: Vec<String>) -> Option<Returning> {
    (!fields.is_empty()).then(|| Returning::from(fields))
}

/// Builds the `get` arguments from command-line flags.
pub fn query_args(
    select: Vec<String>,
    filter: Option<&str>,
    limit: Option<u64>,
    offset: Option<u64>,
    order_by: &[String],
    count: bool,
) -> ConnectResult<QueryArgs> {
    let select = if select.is_empty() {
        Selection::default()
    } else {
        Selection::from(select)
    };
    let mut args = QueryArgs::new(select);
    if let Some(filter) = filter {
        args = args.filter(Filter::from(parse_json(filter, "filter")?));
    }
    if let Some(limit) = limit {
        args = args.limit(limit);
    }
    if let Some(offset) = offset {
        args = args.offset(offset);
    }
    for order in order_by {
        let order: OrderBy = order.parse().map_err(ConnectError::validation)?;
        args = args.order_by(order);
    }
    if count {
        args = args.aggregate(Aggregate::count());
    }
    Ok(args)
}

fn load_batch(file: &PathBuf) -> ConnectResult<Vec<BatchOperation>> {
    let contents = std::fs::read_to_string(file).map_connect_err_with(
        ErrorCode::Validation,
        format!("cannot read {}", file.display()),
    )?;
    let operations = match parse_json(&contents, "batch file")? {
        serde_json::Value::Array(operations) => operations,
        _ => {
            return Err(ConnectError::validation(
                "batch file must hold a JSON array of operations",
            ))
        }
    };
    operations
        .into_iter()
        .map(|op| BatchOperation::try_from(op).map_err(ConnectError::from))
        .collect()
}

/// Resolves the configuration from the file and command-line overrides.
pub fn load_config(cli: &Cli) -> ConnectResult<ConnectorConfig> {
    let mut config = match &cli.config {
        Some(path) => ConnectorConfig::from_file(path)?,
        None => ConnectorConfig::default(),
    };
    config.debug |= cli.debug;

    if config.settings().is_none() && (cli.endpoint.is_some() || cli.streaming_endpoint.is_some())
    {
        config.hasura = Some(OriginSettings::default());
    }
    if let Some(settings) = config.settings_mut() {
        if let Some(endpoint) = &cli.endpoint {
            settings.endpoint = endpoint.clone();
        }
        if let Some(url) = &cli.streaming_endpoint {
            settings.streaming_endpoint = Some(url.clone());
        }
        for (name, value) in &cli.headers {
            settings.headers.insert(name.clone(), value.clone());
        }
    }
    Ok(config)
}

async fn connect(cli: &Cli) -> ConnectResult<Arc<dyn Connector>> {
    let config = load_config(cli)?;
    debug!(
        origin = ?config.origin,
        endpoint = config.settings().map(|s| s.endpoint.as_str()),
        streaming = config.settings().and_then(|s| s.streaming_endpoint.as_deref()),
        token = cli.token.is_some(),
        "resolved connector config"
    );
    let connector = create_connector(config)?;
    if let (Some(token), Some(tokens)) = (&cli.token, connector.token_manager()) {
        tokens.set_token(token.clone()).await;
    }
    Ok(connector)
}

fn print_json(value: &impl serde::Serialize) -> ConnectResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_document(document: &str) -> i32 {
    println!("{}", document);
    0
}

/// Runs one command and returns the process exit code.
pub async fn run(cli: Cli) -> ConnectResult<i32> {
    match &cli.command {
        Commands::Query {
            document,
            variables,
            dry_run,
        }
        | Commands::Mutate {
            document,
            variables,
            dry_run,
        } => {
            let document = read_document(document)?;
            let variables = parse_variables(variables.as_deref())?;
            if *dry_run {
                return Ok(print_document(&document));
            }
            let connector = connect(&cli).await?;
            let data = if matches!(cli.command, Commands::Mutate { .. }) {
                connector.mutate(&document, variables).await?
            } else {
                connector.query(&document, variables).await?
            };
            print_json(&data)?;
            Ok(0)
        }
        Commands::Subscribe {
            document,
            variables,
            count,
            dry_run,
        } => {
            let document = read_document(document)?;
            let variables = parse_variables(variables.as_deref())?;
            if *dry_run {
                return Ok(print_document(&document));
            }
            let connector = connect(&cli).await?;
            subscribe(connector.as_ref(), &document, variables, *count, cli.verbose).await
        }
        Commands::Get {
            table,
            select,
            filter,
            limit,
            offset,
            order_by,
            count,
            dry_run,
        } => {
            let args = query_args(
                select.clone(),
                filter.as_deref(),
                *limit,
                *offset,
                order_by,
                *count,
            )?;
            if *dry_run {
                return Ok(print_document(&query_document(table, &args)));
            }
            let result = connect(&cli).await?.get(table, &args).await?;
            print_json(&result)?;
            Ok(0)
        }
        Commands::Insert {
            table,
            data,
            on_conflict,
            update_columns,
            returning: fields,
            dry_run,
        } => {
            let mut args = InsertArgs::from_value(Value::from(parse_json(data, "data")?));
            if let Some(constraint) = on_conflict {
                args = args.on_conflict(OnConflict::new(constraint).update_columns(update_columns.clone()));
            }
            args.returning = returning(fields.clone());
            if *dry_run {
                return Ok(print_document(&insert_document(table, &args)?));
            }
            let result = connect(&cli).await?.insert(table, &args).await?;
            print_json(&result)?;
            Ok(0)
        }
        Commands::Update {
            table,
            patch,
            filter,
            returning: fields,
            dry_run,
        } => {
            let mut args = UpdateArgs::new(
                Value::from(parse_json(patch, "patch")?),
                Filter::from(parse_json(filter, "filter")?),
            );
            args.returning = returning(fields.clone());
            if *dry_run {
                return Ok(print_document(&update_document(table, &args)?));
            }
            let result = connect(&cli).await?.update(table, &args).await?;
            print_json(&result)?;
            Ok(0)
        }
        Commands::Delete {
            table,
            filter,
            returning: fields,
            dry_run,
        } => {
            let mut args = DeleteArgs::new(Filter::from(parse_json(filter, "filter")?));
            args.returning = returning(fields.clone());
            if *dry_run {
                return Ok(print_document(&delete_document(table, &args)?));
            }
            let result = connect(&cli).await?.delete(table, &args).await?;
            print_json(&result)?;
            Ok(0)
        }
        Commands::Batch { file, dry_run } => {
            let operations = load_batch(file)?;
            if *dry_run {
                return Ok(print_document(&batch_document(&operations)?.document));
            }
            let result = connect(&cli).await?.batch(&operations).await?;
            print_json(&result)?;
            Ok(0)
        }
    }
}

async fn subscribe(
    connector: &dyn Connector,
    document: &str,
    variables: Option<serde_json::Value>,
    count: Option<usize>,
    verbose: bool,
) -> ConnectResult<i32> {
    let (handlers, mut events) = SubscriptionHandlers::channel();
    let handle = connector.subscribe(document, variables, handlers).await?;
    if verbose {
        eprintln!("{} {}", "Subscribed".blue(), handle.id());
    }

    let mut received = 0;
    let code = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SubscriptionEvent::Next(data)) => {
                    print_json(&data)?;
                    received += 1;
                    if count.is_some_and(|limit| received >= limit) {
                        break 0;
                    }
                }
                Some(SubscriptionEvent::Error(err)) => {
                    print_error(&err);
                    break 1;
                }
                Some(SubscriptionEvent::Complete) | None => break 0,
            },
            _ = tokio::signal::ctrl_c() => break 0,
        }
    };

    handle.unsubscribe();
    Ok(code)
}

/// Prints an error with its code highlighted.
pub fn print_error(err: &ConnectError) {
    eprintln!(
        "{} {}",
        format!("{}:", err.code.as_str()).red().bold(),
        err.message
    );
    for extra in err.graphql_errors.iter().skip(1) {
        eprintln!("  {} {}", "-->".blue(), extra.message);
    }
}
