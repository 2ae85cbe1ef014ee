//! MUD Client 終端機版本
//!
//! 用法：`mudconsole <profile>` 或 `mudconsole <host> <port>`

mod config;
mod console;

use std::process::ExitCode;
use std::rc::Rc;

use config::Profile;
use console::{ConsoleSink, LocalCommand};
use mudcore::{JsonFileStore, LuaModuleLoader, Session, TelnetError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::LocalSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    // 初始化日誌
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let profile = match args.as_slice() {
        [name] => Profile::load(name).unwrap_or_else(|| {
            tracing::warn!("找不到 Profile {:?}，使用預設值", Profile::path(name));
            Profile {
                name: name.clone(),
                ..Profile::default()
            }
        }),
        [host, port] => match port.parse() {
            Ok(port) => Profile::direct(host, port),
            Err(_) => {
                eprintln!("無效的連接埠: {}", port);
                return ExitCode::FAILURE;
            }
        },
        _ => {
            eprintln!("用法: mudconsole <profile> | mudconsole <host> <port>");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("無法建立執行環境: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let local = LocalSet::new();
    match local.block_on(&runtime, run(profile)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(profile: Profile) -> Result<(), TelnetError> {
    let session = Session::new(profile.name.as_str(), profile.session.clone(), Rc::new(ConsoleSink));
    session.set_variable_store(Rc::new(JsonFileStore::new(profile.variables_dir())));
    session.set_module_loader(Rc::new(LuaModuleLoader::new(profile.script_dir())));

    for alias in &profile.aliases {
        match alias.build() {
            Ok(a) => {
                session.add_object(a);
            }
            Err(e) => session.report_error(&format!("別名 {}", alias.id), &e),
        }
    }
    for trigger in &profile.triggers {
        match trigger.build() {
            Ok(t) => {
                session.add_object(t);
            }
            Err(e) => session.report_error(&format!("觸發器 {}", trigger.id), &e),
        }
    }
    for id in &profile.modules {
        LocalCommand::Load(id.clone()).apply(&session);
    }

    let input = tokio::task::spawn_local(read_input(session.clone()));
    let result = session.connect_and_run(&profile.host, profile.port).await;
    input.abort();
    session.close();
    result
}

async fn read_input(session: Session) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match LocalCommand::parse(&line) {
                Some(cmd) => {
                    if !cmd.apply(&session) {
                        break;
                    }
                }
                None => session.exec(&line),
            },
            Ok(None) => {
                session.disconnect();
                break;
            }
            Err(e) => {
                tracing::error!("讀取輸入失敗: {}", e);
                session.disconnect();
                break;
            }
        }
    }
}
