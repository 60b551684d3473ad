use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::sync::{mpsc, oneshot, watch};

use crate::infragate::{
    backend::Backend,
    config::{self, Config},
    error::GatewayError,
    events::WebhookDispatcher,
    gateway::Gateway,
    telemetry::ReloadSignal,
};

/// A routing change produced by a config reload.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    Register(Backend),
    Deregister(String),
    Replace { old_id: String, backend: Backend },
}

impl BackendCommand {
    fn label(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Deregister(_) => "deregister",
            Self::Replace { .. } => "replace",
        }
    }
}

/// Commands that turn the `old` server set into `new`.
///
/// Removals come first so their listeners and keys are released before anything
/// else claims them, then replacements, then additions.
pub fn diff_backends(old: &[Backend], new: &[Backend]) -> Vec<BackendCommand> {
    let old: BTreeMap<&str, &Backend> = old.iter().map(|b| (b.id.as_str(), b)).collect();
    let new: BTreeMap<&str, &Backend> = new.iter().map(|b| (b.id.as_str(), b)).collect();

    let mut out = Vec::new();
    for id in old.keys() {
        if !new.contains_key(id) {
            out.push(BackendCommand::Deregister(id.to_string()));
        }
    }
    for (id, b) in &new {
        if let Some(prev) = old.get(id)
            && *prev != *b
        {
            out.push(BackendCommand::Replace {
                old_id: id.to_string(),
                backend: (*b).clone(),
            });
        }
    }
    for (id, b) in &new {
        if !old.contains_key(id) {
            out.push(BackendCommand::Register((*b).clone()));
        }
    }
    out
}

pub async fn apply(gateway: &Gateway, cmd: BackendCommand) -> Result<(), GatewayError> {
    match cmd {
        BackendCommand::Register(b) => gateway.register_backend(b).await,
        BackendCommand::Deregister(id) => {
            gateway.deregister_backend(&id).await;
            Ok(())
        }
        BackendCommand::Replace { old_id, backend } => {
            gateway.replace_backend(&old_id, backend).await
        }
    }
}

/// A queued command and where its outcome goes.
#[derive(Debug)]
pub struct PendingCommand {
    pub command: BackendCommand,
    pub done: oneshot::Sender<Result<(), GatewayError>>,
}

/// Apply commands in arrival order until every sender is gone.
pub async fn command_loop(gateway: Arc<Gateway>, mut rx: mpsc::Receiver<PendingCommand>) {
    while let Some(PendingCommand { command, done }) = rx.recv().await {
        let label = command.label();
        let res = apply(&gateway, command).await;
        if let Err(err) = &res {
            tracing::warn!(command = label, kind = err.kind(), err = %err, "reload: command failed");
        }
        let _ = done.send(res);
    }
}

/// Watches the config file and turns changes into gateway updates.
pub struct Reloader {
    config_path: PathBuf,
    gateway: Arc<Gateway>,
    webhooks: Arc<WebhookDispatcher>,
    commands: mpsc::Sender<PendingCommand>,
    /// Last loaded config, with `servers` holding only what the gateway accepted.
    current: Config,
    /// Some command failed; retry on the next poll even if the file is unchanged.
    retry: bool,
}

impl Reloader {
    pub fn new(
        config_path: PathBuf,
        gateway: Arc<Gateway>,
        webhooks: Arc<WebhookDispatcher>,
        commands: mpsc::Sender<PendingCommand>,
        current: Config,
    ) -> Self {
        Self {
            config_path,
            gateway,
            webhooks,
            commands,
            current,
            retry: false,
        }
    }

    /// Poll the file signature and honor explicit reload requests until shutdown.
    pub async fn run(
        mut self,
        mut reload_rx: watch::Receiver<ReloadSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_sig = file_sig(&self.config_path).ok();

        loop {
            let sleep_dur = if self.current.reload.enabled {
                self.current.reload.poll_interval.max(Duration::from_millis(200))
            } else {
                Duration::from_secs(3600)
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = reload_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    self.apply_reload().await;
                    last_sig = file_sig(&self.config_path).ok();
                }
                _ = tokio::time::sleep(sleep_dur) => {
                    if !self.current.reload.enabled {
                        continue;
                    }
                    let Ok(sig) = file_sig(&self.config_path) else {
                        continue;
                    };
                    if !self.retry && last_sig.is_some_and(|prev| prev == sig) {
                        continue;
                    }
                    self.apply_reload().await;
                    last_sig = Some(sig);
                }
            }
        }
    }

    /// Load the file and push the differences. A bad file leaves everything as it was.
    pub async fn apply_reload(&mut self) {
        let cfg = match config::load_config(&self.config_path) {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(path = %self.config_path.display(), err = %format!("{err:#}"), "reload: config load failed");
                return;
            }
        };
        if cfg == self.current {
            tracing::debug!("reload: no changes");
            return;
        }

        if cfg.admin_addr != self.current.admin_addr || cfg.logging != self.current.logging {
            tracing::warn!("reload: admin_addr/logging changed; restart required to apply");
        }

        if cfg.gateway != self.current.gateway {
            self.gateway.update_options(cfg.gateway.clone());
        }
        if cfg.webhooks != self.current.webhooks {
            self.webhooks.set_targets(cfg.webhooks.clone());
        }

        let cmds = diff_backends(&self.current.servers, &cfg.servers);
        let mut applied: BTreeMap<String, Backend> = self
            .current
            .servers
            .iter()
            .map(|b| (b.id.clone(), b.clone()))
            .collect();
        let (mut ok, mut failed) = (0usize, 0usize);
        for cmd in cmds {
            match self.submit(cmd.clone()).await {
                Some(Ok(())) => {
                    ok += 1;
                    match cmd {
                        BackendCommand::Deregister(id) => {
                            applied.remove(&id);
                        }
                        BackendCommand::Register(b) => {
                            applied.insert(b.id.clone(), b);
                        }
                        BackendCommand::Replace { old_id, backend } => {
                            applied.remove(&old_id);
                            applied.insert(backend.id.clone(), backend);
                        }
                    }
                }
                Some(Err(_)) => failed += 1,
                None => {
                    tracing::warn!("reload: command channel closed");
                    failed += 1;
                    break;
                }
            }
        }

        self.current = Config {
            servers: applied.into_values().collect(),
            ..cfg
        };
        self.retry = failed > 0;
        if failed > 0 {
            tracing::warn!(applied = ok, failed, "reload: partially applied; will retry");
        } else {
            tracing::info!(commands = ok, "reload: applied");
        }
    }

    /// Queue one command and wait for its outcome. `None` once the command loop is gone.
    async fn submit(&self, command: BackendCommand) -> Option<Result<(), GatewayError>> {
        let (done, outcome) = oneshot::channel();
        self.commands
            .send(PendingCommand { command, done })
            .await
            .ok()?;
        outcome.await.ok()
    }
}

fn file_sig(path: &Path) -> anyhow::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let len = meta.len();
    let m = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((m, len))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::net::TcpStream;

    use super::*;
    use crate::infragate::{
        conn::PacketConn,
        events::NoopSink,
        gateway::GatewayOptions,
        router::RoutingKey,
        session::{BackendSession, ClientInfo},
    };

    struct Idle;

    #[async_trait]
    impl BackendSession for Idle {
        async fn serve(
            &self,
            _conn: PacketConn<TcpStream>,
            _client: ClientInfo,
            _backend: Arc<Backend>,
        ) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    fn b(id: &str, domains: &[&str]) -> Backend {
        Backend::new(id, domains, "127.0.0.1:0", "127.0.0.1:1")
    }

    #[test]
    fn diff_orders_removals_then_changes_then_additions() {
        let old = vec![b("keep", &["k.test"]), b("gone", &["g.test"]), b("edit", &["e.test"])];
        let new = vec![
            b("keep", &["k.test"]),
            b("edit", &["e.test", "e2.test"]),
            b("added", &["a.test"]),
        ];
        let cmds = diff_backends(&old, &new);
        assert_eq!(
            cmds,
            vec![
                BackendCommand::Deregister("gone".into()),
                BackendCommand::Replace {
                    old_id: "edit".into(),
                    backend: b("edit", &["e.test", "e2.test"]),
                },
                BackendCommand::Register(b("added", &["a.test"])),
            ]
        );
        assert!(diff_backends(&new, &new).is_empty());
    }

    async fn submit(
        tx: &mpsc::Sender<PendingCommand>,
        command: BackendCommand,
    ) -> Result<(), GatewayError> {
        let (done, outcome) = oneshot::channel();
        tx.send(PendingCommand { command, done }).await.unwrap();
        outcome.await.unwrap()
    }

    #[tokio::test]
    async fn command_loop_applies_in_order() {
        let gw = Gateway::new(GatewayOptions::default(), Arc::new(Idle), Arc::new(NoopSink));
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(command_loop(gw.clone(), rx));

        submit(&tx, BackendCommand::Register(b("svc", &["a.test"])))
            .await
            .unwrap();
        submit(
            &tx,
            BackendCommand::Replace {
                old_id: "svc".into(),
                backend: b("svc", &["a.test", "a2.test"]),
            },
        )
        .await
        .unwrap();
        // Invalid backends are reported and skipped.
        let err = submit(&tx, BackendCommand::Register(b("bad", &["*.test"])))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_backend");
        drop(tx);
        task.await.unwrap();

        let key = RoutingKey::new("a2.test", "127.0.0.1:0");
        assert_eq!(gw.lookup(&key).unwrap().id, "svc");
        assert_eq!(gw.table().len(), 1);
        assert_eq!(gw.listener_count(), 1);

        apply(&gw, BackendCommand::Deregister("svc".into()))
            .await
            .unwrap();
        assert_eq!(gw.listener_count(), 0);
    }

    struct Fixture {
        dir: PathBuf,
        path: PathBuf,
        gw: Arc<Gateway>,
        reloader: Reloader,
    }

    impl Fixture {
        async fn new(name: &str, initial: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "infragate_reload_{name}_{}_{}",
                std::process::id(),
                crate::infragate::telemetry::now_unix_ms()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join("infragate.toml");
            std::fs::write(&path, initial).unwrap();
            let cfg = config::load_config(&path).unwrap();

            let gw = Gateway::new(GatewayOptions::default(), Arc::new(Idle), Arc::new(NoopSink));
            for s in &cfg.servers {
                gw.register_backend(s.clone()).await.unwrap();
            }
            let (webhooks, _task) = WebhookDispatcher::spawn(Vec::new(), 8).unwrap();
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(command_loop(gw.clone(), rx));
            let reloader = Reloader::new(path.clone(), gw.clone(), Arc::new(webhooks), tx, cfg);
            Self {
                dir,
                path,
                gw,
                reloader,
            }
        }

        fn write(&self, contents: &str) {
            std::fs::write(&self.path, contents).unwrap();
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn server(id: &str, host: &str, listen: &str) -> String {
        format!(
            "[servers.{id}]\ndomains = [\"{host}\"]\nlisten_addr = \"{listen}\"\naddress = \"127.0.0.1:1\"\n"
        )
    }

    #[tokio::test]
    async fn apply_reload_applies_diff_and_skips_bad_files() {
        let mut f = Fixture::new("diff", &server("one", "one.test", "127.0.0.1:0")).await;
        let one = RoutingKey::new("one.test", "127.0.0.1:0");
        let two = RoutingKey::new("two.test", "127.0.0.1:0");

        f.write("servers = [[[");
        f.reloader.apply_reload().await;
        assert_eq!(f.gw.lookup(&one).unwrap().id, "one");
        assert_eq!(f.reloader.current.servers.len(), 1);

        f.write(&format!(
            "[gateway]\nclient_timeout_ms = 750\n\n{}",
            server("two", "two.test", "127.0.0.1:0")
        ));
        f.reloader.apply_reload().await;
        assert!(f.gw.lookup(&one).is_none());
        assert_eq!(f.gw.lookup(&two).unwrap().id, "two");
        assert_eq!(f.gw.options().client_timeout, Duration::from_millis(750));
        assert!(!f.reloader.retry);

        // Unchanged file: nothing to do.
        f.reloader.apply_reload().await;
        assert_eq!(f.gw.table().len(), 1);
    }

    #[tokio::test]
    async fn failed_registration_is_retried_on_next_reload() {
        let mut f = Fixture::new("retry", "").await;

        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listen = busy.local_addr().unwrap().to_string();
        let key = RoutingKey::new("late.test", &listen);
        f.write(&server("late", "late.test", &listen));

        f.reloader.apply_reload().await;
        assert!(f.gw.lookup(&key).is_none());
        assert!(f.reloader.current.servers.is_empty());
        assert!(f.reloader.retry);

        // Same file content; the port is free now.
        drop(busy);
        f.reloader.apply_reload().await;
        assert_eq!(f.gw.lookup(&key).unwrap().id, "late");
        assert_eq!(f.reloader.current.servers.len(), 1);
        assert!(!f.reloader.retry);
        f.gw.close().await;
    }
}
