use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use packstash_core::{
    APP_NAME, EngineHandle, FTP_DEFAULT_PORT, Intent, ListView, Mode, PathSelection,
    ProtocolExtra, RemoteAccount, SMB_DEFAULT_PORT, ScriptedChooser, SelectionType, Session,
    SmbAuthMode, SortOrder, SubjectKind, list_external_remotes, spawn_engine, start_task_log,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Parser)]
#[command(name = "packstash")]
#[command(about = "PackStash CLI (backup manager backend)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Account {
        #[command(subcommand)]
        cmd: AccountCmd,
    },
    Active {
        #[command(subcommand)]
        cmd: ActiveCmd,
    },
    Remotes {
        #[command(subcommand)]
        cmd: RemotesCmd,
    },
    Entries {
        #[command(subcommand)]
        cmd: EntriesCmd,
    },
}

#[derive(Subcommand)]
enum AccountCmd {
    List,
    Show {
        name: String,
    },
    AddSmb {
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "")]
        domain: String,
        #[arg(long, default_value = "")]
        share: String,
        #[arg(long, default_value = "password")]
        auth: String,
        #[arg(long, default_value = "")]
        user: String,
        #[arg(long)]
        pass_stdin: bool,
        #[arg(long)]
        edit: bool,
    },
    AddWebdav {
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "")]
        user: String,
        #[arg(long)]
        insecure: bool,
        #[arg(long)]
        pass_stdin: bool,
        #[arg(long)]
        edit: bool,
    },
    AddFtp {
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "")]
        user: String,
        #[arg(long)]
        pass_stdin: bool,
        #[arg(long)]
        edit: bool,
    },
    AddExternal {
        name: String,
        #[arg(long)]
        remote: String,
        #[arg(long)]
        edit: bool,
    },
    SetRoot {
        name: String,
        #[arg(long)]
        root: String,
        #[arg(long, default_value = "")]
        share: String,
    },
    Remove {
        name: String,
    },
    Test {
        name: String,
    },
    Browse {
        name: String,
        #[arg(long)]
        share: Option<String>,
        #[arg(long = "enter")]
        segments: Vec<String>,
        #[arg(long)]
        pick: bool,
    },
}

#[derive(Subcommand)]
enum ActiveCmd {
    Get,
    Set { name: String },
    Clear,
}

#[derive(Subcommand)]
enum RemotesCmd {
    List,
}

#[derive(Subcommand)]
enum EntriesCmd {
    List {
        #[arg(long, default_value = "package")]
        kind: String,
        #[arg(long, default_value = "overview")]
        mode: String,
        #[arg(long, default_value_t = 0)]
        location: usize,
        #[arg(long, default_value = "")]
        key: String,
        #[arg(long, default_value_t = 0)]
        flag: usize,
        #[arg(long = "user")]
        users: Vec<usize>,
        #[arg(long, default_value_t = 0)]
        sort: usize,
        #[arg(long, default_value = "asc")]
        order: String,
        #[arg(long)]
        no_refresh: bool,
    },
    Refresh {
        #[arg(long, default_value = "package")]
        kind: String,
    },
    Delete {
        #[arg(long, default_value = "package")]
        kind: String,
        #[arg(long, default_value_t = 0)]
        location: usize,
        #[arg(long, default_value = "")]
        key: String,
        #[arg(long, default_value_t = 0)]
        flag: usize,
        #[arg(long = "user")]
        users: Vec<usize>,
        #[arg(long = "select")]
        selects: Vec<String>,
    },
    Process {
        #[arg(long, default_value = "package")]
        kind: String,
        #[arg(long, default_value = "backup")]
        mode: String,
        #[arg(long, default_value_t = 0)]
        location: usize,
        #[arg(long, default_value = "")]
        key: String,
        #[arg(long, default_value_t = 0)]
        flag: usize,
        #[arg(long = "user")]
        users: Vec<usize>,
        #[arg(long = "select")]
        selects: Vec<String>,
        #[arg(long)]
        all: bool,
        #[arg(long, default_value = "default")]
        selection: String,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| {
            std::env::var("PACKSTASH_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("PACKSTASH_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Account { cmd } => match cmd {
            AccountCmd::List => account_list(&config_dir, &data_dir, cli.json).await,
            AccountCmd::Show { name } => account_show(&config_dir, &data_dir, &name, cli.json).await,
            AccountCmd::AddSmb {
                name,
                host,
                port,
                domain,
                share,
                auth,
                user,
                pass_stdin,
                edit,
            } => {
                let auth_mode = SmbAuthMode::parse(&auth).ok_or_else(|| {
                    CliError::new("config.invalid", format!("unknown auth mode: {auth}"))
                })?;
                let account = RemoteAccount {
                    name,
                    remote_root: String::new(),
                    host,
                    port: port.or(Some(SMB_DEFAULT_PORT)),
                    user,
                    pass: read_optional_pass(pass_stdin)?,
                    extra: ProtocolExtra::Smb {
                        domain,
                        share,
                        auth_mode,
                    },
                };
                account_add(&config_dir, &data_dir, account, edit, cli.json).await
            }
            AccountCmd::AddWebdav {
                name,
                host,
                port,
                user,
                insecure,
                pass_stdin,
                edit,
            } => {
                let account = RemoteAccount {
                    name,
                    remote_root: String::new(),
                    host,
                    port,
                    user,
                    pass: read_optional_pass(pass_stdin)?,
                    extra: ProtocolExtra::WebDav { insecure },
                };
                account_add(&config_dir, &data_dir, account, edit, cli.json).await
            }
            AccountCmd::AddFtp {
                name,
                host,
                port,
                user,
                pass_stdin,
                edit,
            } => {
                let account = RemoteAccount {
                    name,
                    remote_root: String::new(),
                    host,
                    port: port.or(Some(FTP_DEFAULT_PORT)),
                    user,
                    pass: read_optional_pass(pass_stdin)?,
                    extra: ProtocolExtra::Ftp {},
                };
                account_add(&config_dir, &data_dir, account, edit, cli.json).await
            }
            AccountCmd::AddExternal { name, remote, edit } => {
                let account = RemoteAccount {
                    name,
                    remote_root: String::new(),
                    host: String::new(),
                    port: None,
                    user: String::new(),
                    pass: String::new(),
                    extra: ProtocolExtra::External {
                        config_name: remote,
                    },
                };
                account_add(&config_dir, &data_dir, account, edit, cli.json).await
            }
            AccountCmd::SetRoot { name, root, share } => {
                account_set_root(&config_dir, &data_dir, &name, root, share, cli.json).await
            }
            AccountCmd::Remove { name } => {
                account_remove(&config_dir, &data_dir, &name, cli.json).await
            }
            AccountCmd::Test { name } => account_test(&config_dir, &data_dir, &name, cli.json).await,
            AccountCmd::Browse {
                name,
                share,
                segments,
                pick,
            } => account_browse(&config_dir, &data_dir, &name, share, segments, pick, cli.json).await,
        },
        Command::Active { cmd } => match cmd {
            ActiveCmd::Get => active_get(&config_dir, &data_dir, cli.json).await,
            ActiveCmd::Set { name } => active_set(&config_dir, &data_dir, Some(&name), cli.json).await,
            ActiveCmd::Clear => active_set(&config_dir, &data_dir, None, cli.json).await,
        },
        Command::Remotes { cmd } => match cmd {
            RemotesCmd::List => remotes_list(&config_dir, cli.json),
        },
        Command::Entries { cmd } => match cmd {
            EntriesCmd::List {
                kind,
                mode,
                location,
                key,
                flag,
                users,
                sort,
                order,
                no_refresh,
            } => {
                entries_list(
                    &config_dir,
                    &data_dir,
                    ListArgs {
                        kind,
                        mode,
                        location,
                        key,
                        flag,
                        users,
                        sort,
                        order,
                    },
                    no_refresh,
                    cli.json,
                )
                .await
            }
            EntriesCmd::Refresh { kind } => {
                entries_refresh(&config_dir, &data_dir, &kind, cli.json).await
            }
            EntriesCmd::Delete {
                kind,
                location,
                key,
                flag,
                users,
                selects,
            } => {
                entries_delete(
                    &config_dir,
                    &data_dir,
                    &kind,
                    FacetArgs {
                        location,
                        key,
                        flag,
                        users,
                    },
                    selects,
                    cli.json,
                )
                .await
            }
            EntriesCmd::Process {
                kind,
                mode,
                location,
                key,
                flag,
                users,
                selects,
                all,
                selection,
            } => {
                entries_process(
                    &config_dir,
                    &data_dir,
                    &kind,
                    &mode,
                    FacetArgs {
                        location,
                        key,
                        flag,
                        users,
                    },
                    selects,
                    all,
                    &selection,
                    cli.json,
                )
                .await
            }
        },
    }
}

async fn account_list(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let session = open_session(config_dir, data_dir).await?;
    let in_use = session
        .catalog()
        .remotes_in_use()
        .await
        .map_err(map_core_err)?;
    let active = session.registry().active_account().map(str::to_string);

    let lines: Vec<serde_json::Value> = session
        .registry()
        .accounts()
        .iter()
        .map(|a| {
            let summary = a.describe();
            serde_json::json!({
                "name": summary.name,
                "protocol": summary.protocol,
                "endpoint": summary.endpoint,
                "remoteRoot": summary.remote_root,
                "active": active.as_deref() == Some(a.name.as_str()),
                "inUse": in_use.contains(&a.name),
            })
        })
        .collect();

    if json {
        println!(
            "{}",
            serde_json::json!({ "accounts": lines, "active": active })
        );
    } else {
        for line in &lines {
            println!("{line}");
        }
    }
    Ok(())
}

async fn account_show(
    config_dir: &Path,
    data_dir: &Path,
    name: &str,
    json: bool,
) -> Result<(), CliError> {
    let session = open_session(config_dir, data_dir).await?;
    let account = session
        .registry()
        .find_by_name(name)
        .ok_or_else(|| CliError::new("account.not_found", format!("no such account: {name}")))?;

    let summary = account.describe();
    let validation = account.validate();
    let missing: Vec<&str> = validation.missing.iter().map(|f| f.as_str()).collect();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "account": summary,
                "complete": validation.complete,
                "missing": missing,
                "readyForBackup": account.ready_for_backup(),
            })
        );
    } else {
        println!("name={}", summary.name);
        println!("protocol={}", summary.protocol);
        println!("endpoint={}", summary.endpoint);
        println!("remoteRoot={}", summary.remote_root);
        println!("complete={}", validation.complete);
        if !missing.is_empty() {
            println!("missing={}", missing.join(","));
        }
        println!("readyForBackup={}", account.ready_for_backup());
    }
    Ok(())
}

async fn account_add(
    config_dir: &Path,
    data_dir: &Path,
    account: RemoteAccount,
    edit: bool,
    json: bool,
) -> Result<(), CliError> {
    let mut session = open_session(config_dir, data_dir).await?;
    let name = account.name.clone();
    session
        .upsert_account(account, edit)
        .map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "ok": true, "name": name }));
    } else {
        println!("ok");
    }
    Ok(())
}

async fn account_set_root(
    config_dir: &Path,
    data_dir: &Path,
    name: &str,
    root: String,
    share: String,
    json: bool,
) -> Result<(), CliError> {
    let mut session = open_session(config_dir, data_dir).await?;
    let selection = PathSelection { path: root, share };
    session
        .apply_path_selection(name, &selection)
        .map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "name": name, "remoteRoot": selection.path })
        );
    } else {
        println!("ok");
    }
    Ok(())
}

async fn account_remove(
    config_dir: &Path,
    data_dir: &Path,
    name: &str,
    json: bool,
) -> Result<(), CliError> {
    let mut session = open_session(config_dir, data_dir).await?;
    session.delete_account(name).await.map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "ok": true, "name": name }));
    } else {
        println!("ok");
    }
    Ok(())
}

async fn account_test(
    config_dir: &Path,
    data_dir: &Path,
    name: &str,
    json: bool,
) -> Result<(), CliError> {
    let session = open_session(config_dir, data_dir).await?;
    let account = session
        .registry()
        .find_by_name(name)
        .ok_or_else(|| CliError::new("account.not_found", format!("no such account: {name}")))?
        .clone();

    let task_id = uuid::Uuid::new_v4().to_string();
    let _log = start_task_log("probe", &task_id, data_dir)
        .map_err(|e| CliError::new("io.failed", e.to_string()))?;
    let cancel = ctrl_c_token();

    session
        .prober()
        .test_connection(&account, Some(&cancel))
        .await
        .map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "ok": true, "name": name }));
    } else {
        println!("ok");
    }
    Ok(())
}

async fn account_browse(
    config_dir: &Path,
    data_dir: &Path,
    name: &str,
    share: Option<String>,
    segments: Vec<String>,
    pick: bool,
    json: bool,
) -> Result<(), CliError> {
    let mut session = open_session(config_dir, data_dir).await?;
    let account = session
        .registry()
        .find_by_name(name)
        .ok_or_else(|| CliError::new("account.not_found", format!("no such account: {name}")))?
        .clone();

    let task_id = uuid::Uuid::new_v4().to_string();
    let _log = start_task_log("probe", &task_id, data_dir)
        .map_err(|e| CliError::new("io.failed", e.to_string()))?;
    let cancel = ctrl_c_token();

    let mut chooser = ScriptedChooser::new(share, segments);
    let selection = session
        .prober()
        .browse_remote_path(&account, &mut chooser, Some(&cancel))
        .await
        .map_err(map_core_err)?;

    let Some(selection) = selection else {
        if json {
            println!(
                "{}",
                serde_json::json!({ "picked": serde_json::Value::Null, "applied": false })
            );
        } else {
            println!("nothing picked");
        }
        return Ok(());
    };

    if pick {
        session
            .apply_path_selection(name, &selection)
            .map_err(map_core_err)?;
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "picked": { "path": selection.path, "share": selection.share },
                "applied": pick,
            })
        );
    } else {
        println!("path={}", selection.path);
        println!("share={}", selection.share);
        println!("applied={pick}");
    }
    Ok(())
}

async fn active_get(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let session = open_session(config_dir, data_dir).await?;
    let active = session.registry().active_account();

    if json {
        println!("{}", serde_json::json!({ "active": active }));
    } else {
        println!("active={}", active.unwrap_or(""));
    }
    Ok(())
}

async fn active_set(
    config_dir: &Path,
    data_dir: &Path,
    name: Option<&str>,
    json: bool,
) -> Result<(), CliError> {
    let mut session = open_session(config_dir, data_dir).await?;
    session
        .registry_mut()
        .set_active_account(name)
        .map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "ok": true, "active": name }));
    } else {
        println!("ok");
    }
    Ok(())
}

fn remotes_list(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let remotes = list_external_remotes(config_dir).map_err(map_core_err)?;

    if json {
        let out: Vec<_> = remotes
            .iter()
            .map(|r| serde_json::json!({ "name": r.name, "type": r.remote_type }))
            .collect();
        println!("{}", serde_json::json!({ "remotes": out }));
    } else {
        for remote in &remotes {
            println!(
                "{}",
                serde_json::json!({ "name": remote.name, "type": remote.remote_type })
            );
        }
    }
    Ok(())
}

struct ListArgs {
    kind: String,
    mode: String,
    location: usize,
    key: String,
    flag: usize,
    users: Vec<usize>,
    sort: usize,
    order: String,
}

struct FacetArgs {
    location: usize,
    key: String,
    flag: usize,
    users: Vec<usize>,
}

async fn entries_list(
    config_dir: &Path,
    data_dir: &Path,
    args: ListArgs,
    no_refresh: bool,
    json: bool,
) -> Result<(), CliError> {
    let kind = parse_kind(&args.kind)?;
    let mode = Mode::parse(&args.mode)
        .ok_or_else(|| CliError::new("config.invalid", format!("unknown mode: {}", args.mode)))?;
    let order = SortOrder::parse(&args.order)
        .ok_or_else(|| CliError::new("config.invalid", format!("unknown order: {}", args.order)))?;

    let session = open_session(config_dir, data_dir).await?;
    let handle = spawn_engine(session.engine_deps(kind)).await;

    handle.send(Intent::SetMode(mode)).await;
    if args.location > 0 {
        handle.send(Intent::FilterByLocation(args.location)).await;
    }
    if !args.key.is_empty() {
        handle.send(Intent::FilterByKey(args.key)).await;
    }
    if args.flag > 0 {
        handle.send(Intent::FilterByFlag(args.flag)).await;
    }
    if args.sort > 0 || order == SortOrder::Descending {
        handle
            .send(Intent::Sort {
                index: args.sort,
                order,
            })
            .await;
    }

    let view = if no_refresh {
        handle.query().await
    } else {
        let task_id = uuid::Uuid::new_v4().to_string();
        let _log = start_task_log("refresh", &task_id, data_dir)
            .map_err(|e| CliError::new("io.failed", e.to_string()))?;
        handle.refresh_and_wait().await
    };
    if let Some(notice) = view.notice.clone() {
        handle.shutdown().await;
        return Err(CliError::retryable("refresh.failed", notice));
    }

    // The user facet indexes into the scanned domain, so it applies after
    // the snapshot is in.
    let view = if args.users.is_empty() {
        view
    } else {
        handle.send(Intent::SetUserIdIndexList(args.users)).await;
        handle.query().await
    };

    print_view(&view, json)?;
    handle.shutdown().await;
    Ok(())
}

async fn entries_refresh(
    config_dir: &Path,
    data_dir: &Path,
    kind: &str,
    json: bool,
) -> Result<(), CliError> {
    let kind = parse_kind(kind)?;
    let session = open_session(config_dir, data_dir).await?;
    let handle = spawn_engine(session.engine_deps(kind)).await;

    let task_id = uuid::Uuid::new_v4().to_string();
    let _log = start_task_log("refresh", &task_id, data_dir)
        .map_err(|e| CliError::new("io.failed", e.to_string()))?;
    debug!(event = "cli.refresh", kind = kind.as_str(), task_id = %task_id, "cli.refresh");

    let view = handle.refresh_and_wait().await;
    let notice = view.notice.clone();
    let rows = view.rows.len();
    handle.shutdown().await;

    if let Some(notice) = notice {
        return Err(CliError::retryable("refresh.failed", notice));
    }
    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "kind": kind.as_str(), "rows": rows })
        );
    } else {
        println!("rows={rows}");
    }
    Ok(())
}

async fn entries_delete(
    config_dir: &Path,
    data_dir: &Path,
    kind: &str,
    facets: FacetArgs,
    selects: Vec<String>,
    json: bool,
) -> Result<(), CliError> {
    if selects.is_empty() {
        return Err(CliError::new("config.invalid", "nothing selected"));
    }
    let kind = parse_kind(kind)?;
    let session = open_session(config_dir, data_dir).await?;
    let handle = spawn_engine(session.engine_deps(kind)).await;

    let task_id = uuid::Uuid::new_v4().to_string();
    let _log = start_task_log("delete", &task_id, data_dir)
        .map_err(|e| CliError::new("io.failed", e.to_string()))?;
    debug!(event = "cli.delete", kind = kind.as_str(), task_id = %task_id, "cli.delete");

    handle.send(Intent::SetMode(Mode::BatchRestore)).await;
    let view = apply_facets_and_refresh(&handle, facets).await?;
    if let Some(notice) = view.notice.clone() {
        handle.shutdown().await;
        return Err(CliError::retryable("refresh.failed", notice));
    }

    let picked = select_rows(&handle, &view, &selects).await?;

    let view = handle.delete_and_wait().await;
    let notice = view.notice.clone();
    let rows = view.rows.len();
    handle.shutdown().await;

    if let Some(notice) = notice {
        return Err(CliError::retryable("delete.failed", notice));
    }
    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "deleted": picked, "rows": rows })
        );
    } else {
        println!("deleted={picked}");
        println!("rows={rows}");
    }
    Ok(())
}

async fn entries_process(
    config_dir: &Path,
    data_dir: &Path,
    kind: &str,
    mode: &str,
    facets: FacetArgs,
    selects: Vec<String>,
    all: bool,
    selection: &str,
    json: bool,
) -> Result<(), CliError> {
    if selects.is_empty() && !all {
        return Err(CliError::new("config.invalid", "nothing selected"));
    }
    let kind = parse_kind(kind)?;
    let mode = match Mode::parse(mode) {
        Some(mode @ (Mode::BatchBackup | Mode::BatchRestore)) => mode,
        _ => {
            return Err(CliError::new(
                "config.invalid",
                format!("process mode must be backup or restore (got {mode})"),
            ));
        }
    };
    let selection = SelectionType::parse(selection).ok_or_else(|| {
        CliError::new("config.invalid", format!("unknown selection: {selection}"))
    })?;

    let session = open_session(config_dir, data_dir).await?;
    let handle = spawn_engine(session.engine_deps(kind)).await;

    let task_id = uuid::Uuid::new_v4().to_string();
    let _log = start_task_log("process", &task_id, data_dir)
        .map_err(|e| CliError::new("io.failed", e.to_string()))?;
    debug!(event = "cli.process", kind = kind.as_str(), task_id = %task_id, "cli.process");

    handle.send(Intent::SetMode(mode)).await;
    let view = apply_facets_and_refresh(&handle, facets).await?;
    if let Some(notice) = view.notice.clone() {
        handle.shutdown().await;
        return Err(CliError::retryable("refresh.failed", notice));
    }

    let picked = if all {
        handle.send(Intent::SelectAll).await;
        handle.query().await.activated_count
    } else {
        select_rows(&handle, &view, &selects).await?
    };
    if picked == 0 {
        handle.shutdown().await;
        return Err(CliError::new("config.invalid", "nothing selected"));
    }

    let view = handle.process_and_wait(selection).await;
    let notice = view.notice.clone();
    handle.shutdown().await;

    if let Some(notice) = notice {
        return Err(CliError::retryable("process.failed", notice));
    }
    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "processed": picked, "selection": selection.as_str() })
        );
    } else {
        println!("processed={picked}");
    }
    Ok(())
}

async fn apply_facets_and_refresh(
    handle: &EngineHandle,
    facets: FacetArgs,
) -> Result<ListView, CliError> {
    if facets.location > 0 {
        handle.send(Intent::FilterByLocation(facets.location)).await;
    }
    if !facets.key.is_empty() {
        handle.send(Intent::FilterByKey(facets.key)).await;
    }
    if facets.flag > 0 {
        handle.send(Intent::FilterByFlag(facets.flag)).await;
    }

    let view = handle.refresh_and_wait().await;
    if facets.users.is_empty() {
        return Ok(view);
    }
    handle.send(Intent::SetUserIdIndexList(facets.users)).await;
    Ok(handle.query().await)
}

/// Matches `--select` specs against the visible rows and activates them.
/// A spec is `subject_id` (every visible row of that subject) or
/// `subject_id@preserve_id` (one snapshot). Unmatched specs are errors so a
/// typo never silently deletes nothing.
async fn select_rows(
    handle: &EngineHandle,
    view: &ListView,
    selects: &[String],
) -> Result<usize, CliError> {
    let mut picked = std::collections::HashSet::new();
    for spec in selects {
        let (subject, preserve) = match spec.split_once('@') {
            Some((subject, raw)) => {
                let preserve: i64 = raw.parse().map_err(|_| {
                    CliError::new("config.invalid", format!("bad preserve id in {spec}"))
                })?;
                (subject, Some(preserve))
            }
            None => (spec.as_str(), None),
        };

        let matches: Vec<_> = view
            .rows
            .iter()
            .filter(|row| {
                row.identity.subject_id == subject
                    && preserve.is_none_or(|p| row.preserve_id == p)
            })
            .collect();
        if matches.is_empty() {
            return Err(CliError::new(
                "entry.not_found",
                format!("no visible row matches {spec}"),
            ));
        }
        for row in matches {
            if picked.insert(row.identity.clone()) {
                handle.send(Intent::Select(row.identity.clone())).await;
            }
        }
    }
    Ok(picked.len())
}

fn print_view(view: &ListView, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::json!({ "view": view }));
    } else {
        for row in &view.rows {
            println!(
                "{}",
                serde_json::to_string(row)
                    .map_err(|e| CliError::new("io.failed", e.to_string()))?
            );
        }
    }
    Ok(())
}

async fn open_session(config_dir: &Path, data_dir: &Path) -> Result<Session, CliError> {
    Session::open(config_dir, data_dir)
        .await
        .map_err(map_core_err)
}

fn parse_kind(kind: &str) -> Result<SubjectKind, CliError> {
    SubjectKind::parse(kind)
        .ok_or_else(|| CliError::new("config.invalid", format!("unknown kind: {kind}")))
}

fn read_optional_pass(pass_stdin: bool) -> Result<String, CliError> {
    if !pass_stdin {
        return Ok(String::new());
    }
    let mut pass = String::new();
    std::io::stdin()
        .read_to_string(&mut pass)
        .map_err(|e| CliError::new("io.failed", e.to_string()))?;
    Ok(pass.trim_end_matches(['\r', '\n']).to_string())
}

/// Token cancelled on the first Ctrl-C, so probes and browses abort cleanly
/// instead of being killed mid-request.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

fn default_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join(APP_NAME.to_lowercase());
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".config")
        .join(APP_NAME.to_lowercase())
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join(APP_NAME.to_lowercase());
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join(APP_NAME.to_lowercase())
}

fn map_core_err(e: packstash_core::Error) -> CliError {
    match e {
        packstash_core::Error::Validation { message } => CliError::new("account.invalid", message),
        packstash_core::Error::DuplicateName { name } => CliError::new(
            "account.duplicate",
            format!("account already exists: {name}"),
        ),
        packstash_core::Error::NotFound { name } => {
            CliError::new("account.not_found", format!("no such account: {name}"))
        }
        packstash_core::Error::AccountInUse { name, entries } => {
            let mut err = CliError::new(
                "account.in_use",
                format!("{entries} backup entries still reference {name}"),
            );
            err.details = serde_json::json!({ "name": name, "entries": entries });
            err
        }
        packstash_core::Error::Probe { message } => CliError::retryable("probe.failed", message),
        packstash_core::Error::CapabilityMissing { message } => {
            CliError::new("capability.missing", message)
        }
        packstash_core::Error::InvalidConfig { message } => {
            CliError::new("config.invalid", message)
        }
        packstash_core::Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        packstash_core::Error::Io(e) => CliError::new("io.failed", e.to_string()),
        packstash_core::Error::Sqlite(e) => CliError::new("db.failed", e.to_string()),
        packstash_core::Error::SqliteMigrate(e) => CliError::new("db.failed", e.to_string()),
        packstash_core::Error::Walkdir(e) => CliError::new("scan.failed", e.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
