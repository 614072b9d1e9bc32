//! Orchestrator for instance lifecycle operations

use std::collections::HashMap;

use crate::images::{self, ImageRecord};
use crate::instance::{validate_name, CreateInstanceRequest, Instance, InstanceRecord, Remote};
use crate::lxd::{
    image_progress, CancelToken, DaemonApi, ExecRequest, FollowOutcome, FollowerConfig,
    OperationFollower, StateAction,
};
use crate::network::PROFILE_NAME;
use crate::{Error, Result};

const SHELL_PROMPT: &str = r"\[\033[01;32m\]\u@\h\[\033[00m\]:\[\033[01;34m\]\w\[\033[00m\] \# ";

/// Hands the user's terminal over to an exec session
pub trait TerminalAttach {
    /// Block until the session behind `stream_url` ends
    fn attach(&self, stream_url: &str, control_url: &str) -> Result<()>;
}

/// Starts, stops, launches and attaches to instances
pub struct Orchestrator<'a, D: DaemonApi + ?Sized> {
    api: &'a D,
    port: u16,
    profile: String,
    follower: FollowerConfig,
    cancel: CancelToken,
}

impl<'a, D: DaemonApi + ?Sized> Orchestrator<'a, D> {
    /// `port` is the host port the daemon is forwarded to
    pub fn new(api: &'a D, port: u16) -> Self {
        Self {
            api,
            port,
            profile: PROFILE_NAME.to_string(),
            follower: FollowerConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn follower_config(mut self, config: FollowerConfig) -> Self {
        self.follower = config;
        self
    }

    /// Token that interrupts a launch while its image is being fetched
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// All instances, as listing rows
    pub fn list(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .api
            .list_instances()?
            .iter()
            .map(InstanceRecord::from)
            .collect())
    }

    pub fn info(&self, name: &str) -> Result<Instance> {
        validate_name(name)?;
        self.api.get_instance(name)
    }

    pub fn start(&self, names: &[String]) -> Result<()> {
        self.each("start", names, |name| {
            self.api.change_state(name, StateAction::Start, false)
        })
    }

    pub fn stop(&self, names: &[String], force: bool) -> Result<()> {
        self.each("stop", names, |name| {
            self.api.change_state(name, StateAction::Stop, force)
        })
    }

    /// Delete instances; with `force`, running ones are stopped first
    pub fn delete(&self, names: &[String], force: bool) -> Result<()> {
        self.each("delete", names, |name| {
            if force && self.api.get_instance(name)?.is_running() {
                self.api.change_state(name, StateAction::Stop, true)?;
            }
            self.api.delete_instance(name)
        })
    }

    /// Apply `f` to each name in order, stopping at the first failure
    fn each(
        &self,
        action: &'static str,
        names: &[String],
        f: impl Fn(&str) -> Result<()>,
    ) -> Result<()> {
        for name in names {
            tracing::info!(instance = %name, action, "Changing instance state");
            validate_name(name)
                .and_then(|_| f(name.as_str()))
                .map_err(|e| Error::InstanceAction {
                    action,
                    name: name.clone(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    /// Create `name` from `remote:image` and start it
    pub fn launch(&self, remote: &str, image: &str, name: &str) -> Result<()> {
        let remote: Remote = remote.parse()?;
        validate_name(name)?;

        self.create_and_start(remote, image, name)
            .map_err(|e| Error::Launch {
                name: name.to_string(),
                source: Box::new(e),
            })
    }

    fn create_and_start(&self, remote: Remote, image: &str, name: &str) -> Result<()> {
        let profiles = ["default", self.profile.as_str()];
        let request = CreateInstanceRequest::from_image(name, remote, image, &profiles);

        tracing::info!(instance = %name, remote = %remote, image = %image, "Launching instance");
        let operation = self.api.create_instance(&request)?;

        let mut follower = OperationFollower::new(self.api, self.follower.clone(), self.cancel.clone());
        if follower.follow(&operation, Some(image_progress))? == FollowOutcome::Interrupted {
            tracing::warn!(instance = %name, "Launch interrupted before the instance was started");
            return Ok(());
        }

        self.api.change_state(name, StateAction::Start, false)
    }

    /// Run `command` in `name` with the terminal attached
    pub fn exec(&self, name: &str, command: &[String], terminal: &dyn TerminalAttach) -> Result<()> {
        if command.is_empty() {
            return Ok(());
        }
        self.attach(name, command.to_vec(), HashMap::new(), terminal)
    }

    /// Root shell in `name`
    pub fn shell(&self, name: &str, terminal: &dyn TerminalAttach) -> Result<()> {
        let environment = HashMap::from([("PS1".to_string(), SHELL_PROMPT.to_string())]);
        self.attach(
            name,
            vec!["su".to_string(), "root".to_string()],
            environment,
            terminal,
        )
    }

    fn attach(
        &self,
        name: &str,
        command: Vec<String>,
        environment: HashMap<String, String>,
        terminal: &dyn TerminalAttach,
    ) -> Result<()> {
        validate_name(name)?;
        let request = ExecRequest {
            command,
            environment,
            interactive: true,
            wait_for_websocket: true,
        };
        let session = self.api.exec(name, &request)?;

        let secret = |fd: &str| {
            session.fds.get(fd).ok_or_else(|| {
                Error::Protocol(format!("exec operation {} has no '{}' websocket", session.operation, fd))
            })
        };
        let stream_url = self.websocket_url(&session.operation, secret("0")?);
        let control_url = self.websocket_url(&session.operation, secret("control")?);

        tracing::debug!(instance = %name, operation = %session.operation, "Attaching terminal");
        terminal.attach(&stream_url, &control_url)
    }

    fn websocket_url(&self, operation: &str, secret: &str) -> String {
        format!(
            "ws://127.0.0.1:{}{}/websocket?secret={}",
            self.port, operation, secret
        )
    }

    /// Images already cached by the daemon
    pub fn cached_images(&self) -> Result<Vec<ImageRecord>> {
        Ok(images::list_cached_images(self.api.list_images()?))
    }

    pub fn remotes(&self) -> Vec<Remote> {
        Remote::ALL.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lxd::client::MockDaemonApi;
    use crate::lxd::{ExecSession, Operation, OperationMetadata, OperationStatus};
    use mockall::predicate::eq;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn fast() -> FollowerConfig {
        FollowerConfig::new()
            .creation_delay(Duration::ZERO)
            .poll_interval(Duration::ZERO)
    }

    fn finished(uri: &str) -> Operation {
        Operation {
            uri: uri.to_string(),
            id: "op".into(),
            description: "Creating instance".into(),
            status: OperationStatus::Success,
            status_code: 200,
            metadata: OperationMetadata::Empty,
            err: String::new(),
        }
    }

    #[derive(Default)]
    struct RecordingTerminal {
        urls: Mutex<Vec<(String, String)>>,
    }

    impl TerminalAttach for RecordingTerminal {
        fn attach(&self, stream_url: &str, control_url: &str) -> Result<()> {
            self.urls
                .lock()
                .push((stream_url.to_string(), control_url.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_batch_stops_at_first_failure() {
        let mut api = MockDaemonApi::new();
        api.expect_change_state()
            .with(eq("a"), eq(StateAction::Start), eq(false))
            .times(1)
            .returning(|_, _, _| Ok(()));
        api.expect_change_state()
            .with(eq("b"), eq(StateAction::Start), eq(false))
            .times(1)
            .returning(|name, _, _| Err(Error::NotFound(name.to_string())));
        api.expect_change_state()
            .with(eq("c"), eq(StateAction::Start), eq(false))
            .never();

        let orchestrator = Orchestrator::new(&api, 4242);
        let err = orchestrator.start(&names(&["a", "b", "c"])).unwrap_err();

        match &err {
            Error::InstanceAction { action, name, .. } => {
                assert_eq!(*action, "start");
                assert_eq!(name, "b");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invalid_name_in_batch_stops_before_daemon() {
        // only "a" may reach the daemon; any other call has no expectation
        let mut api = MockDaemonApi::new();
        api.expect_get_instance()
            .with(eq("a"))
            .times(1)
            .returning(|name| {
                Ok(Instance {
                    name: name.to_string(),
                    status: "Stopped".into(),
                    config: HashMap::new(),
                    state: None,
                })
            });
        api.expect_delete_instance()
            .with(eq("a"))
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator = Orchestrator::new(&api, 4242);
        let err = orchestrator
            .delete(&names(&["a", "../networks/yurt-int", "c"]), true)
            .unwrap_err();

        match err {
            Error::InstanceAction { action, name, source } => {
                assert_eq!(action, "delete");
                assert_eq!(name, "../networks/yurt-int");
                assert!(matches!(*source, Error::InvalidName(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_info_and_exec_reject_invalid_names() {
        let mut api = MockDaemonApi::new();
        api.expect_get_instance().never();
        api.expect_exec().never();

        let orchestrator = Orchestrator::new(&api, 4242);
        assert!(matches!(
            orchestrator.info("web?project=other"),
            Err(Error::InvalidName(_))
        ));
        let terminal = RecordingTerminal::default();
        assert!(matches!(
            orchestrator.exec("..", &names(&["ls"]), &terminal),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            orchestrator.shell("a/b", &terminal),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn test_stop_passes_force() {
        let mut api = MockDaemonApi::new();
        api.expect_change_state()
            .with(eq("web"), eq(StateAction::Stop), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));

        Orchestrator::new(&api, 4242)
            .stop(&names(&["web"]), true)
            .unwrap();
    }

    #[test]
    fn test_force_delete_stops_running_instance() {
        let mut api = MockDaemonApi::new();
        api.expect_get_instance().returning(|name| {
            Ok(Instance {
                name: name.to_string(),
                status: "Running".into(),
                config: HashMap::new(),
                state: None,
            })
        });
        api.expect_change_state()
            .with(eq("web"), eq(StateAction::Stop), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));
        api.expect_delete_instance()
            .with(eq("web"))
            .times(1)
            .returning(|_| Ok(()));

        Orchestrator::new(&api, 4242)
            .delete(&names(&["web"]), true)
            .unwrap();
    }

    #[test]
    fn test_launch_rejects_bad_input_before_daemon() {
        let api = MockDaemonApi::new();
        let orchestrator = Orchestrator::new(&api, 4242);

        assert!(matches!(
            orchestrator.launch("dockerhub", "alpine/3.12", "web"),
            Err(Error::UnsupportedRemote(_))
        ));
        assert!(matches!(
            orchestrator.launch("images", "alpine/3.12", "-web"),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn test_launch_creates_and_starts() {
        let mut api = MockDaemonApi::new();
        api.expect_create_instance()
            .withf(|req| {
                req.name == "web"
                    && req.profiles == ["default", "yurt"]
                    && req.source.alias == "alpine/3.12"
                    && req.source.server == "https://images.linuxcontainers.org"
            })
            .times(1)
            .returning(|_| Ok("/1.0/operations/abc".into()));
        api.expect_get_operation()
            .returning(|uri| Ok(finished(uri)));
        api.expect_change_state()
            .with(eq("web"), eq(StateAction::Start), eq(false))
            .times(1)
            .returning(|_, _, _| Ok(()));

        Orchestrator::new(&api, 4242)
            .follower_config(fast())
            .launch("images", "alpine/3.12", "web")
            .unwrap();
    }

    #[test]
    fn test_launch_wraps_daemon_failure() {
        let mut api = MockDaemonApi::new();
        api.expect_create_instance()
            .returning(|_| Err(Error::Api("image not found".into())));
        api.expect_change_state().never();

        let err = Orchestrator::new(&api, 4242)
            .launch("ubuntu", "20.04", "web")
            .unwrap_err();
        assert!(matches!(err, Error::Launch { ref name, .. } if name == "web"));
    }

    #[test]
    fn test_interrupted_launch_does_not_start() {
        let mut api = MockDaemonApi::new();
        api.expect_create_instance()
            .returning(|_| Ok("/1.0/operations/abc".into()));
        api.expect_get_operation().returning(|uri| {
            let mut op = finished(uri);
            op.status = OperationStatus::Running;
            Ok(op)
        });
        api.expect_change_state().never();

        let cancel = CancelToken::new();
        cancel.cancel();

        Orchestrator::new(&api, 4242)
            .follower_config(fast())
            .cancel_token(cancel)
            .launch("images", "alpine/3.12", "web")
            .unwrap();
    }

    #[test]
    fn test_exec_builds_websocket_urls() {
        let mut api = MockDaemonApi::new();
        api.expect_exec()
            .withf(|name, req| {
                name == "web" && req.command == ["ls", "-la"] && req.interactive && req.wait_for_websocket
            })
            .returning(|_, _| {
                Ok(ExecSession {
                    operation: "/1.0/operations/xyz".into(),
                    fds: HashMap::from([
                        ("0".to_string(), "s0".to_string()),
                        ("control".to_string(), "sc".to_string()),
                    ]),
                })
            });

        let terminal = RecordingTerminal::default();
        Orchestrator::new(&api, 4242)
            .exec("web", &names(&["ls", "-la"]), &terminal)
            .unwrap();

        assert_eq!(
            terminal.urls.lock().as_slice(),
            [(
                "ws://127.0.0.1:4242/1.0/operations/xyz/websocket?secret=s0".to_string(),
                "ws://127.0.0.1:4242/1.0/operations/xyz/websocket?secret=sc".to_string(),
            )]
        );
    }

    #[test]
    fn test_exec_without_stream_secret() {
        let mut api = MockDaemonApi::new();
        api.expect_exec().returning(|_, _| {
            Ok(ExecSession {
                operation: "/1.0/operations/xyz".into(),
                fds: HashMap::new(),
            })
        });

        let terminal = RecordingTerminal::default();
        let err = Orchestrator::new(&api, 4242)
            .shell("web", &terminal)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(terminal.urls.lock().is_empty());
    }

    #[test]
    fn test_empty_command_is_noop() {
        let mut api = MockDaemonApi::new();
        api.expect_exec().never();

        let terminal = RecordingTerminal::default();
        Orchestrator::new(&api, 4242)
            .exec("web", &[], &terminal)
            .unwrap();
    }

    #[test]
    fn test_shell_runs_root_with_prompt() {
        let mut api = MockDaemonApi::new();
        api.expect_exec()
            .withf(|_, req| {
                req.command == ["su", "root"]
                    && req.environment.get("PS1").map(String::as_str) == Some(SHELL_PROMPT)
            })
            .times(1)
            .returning(|_, _| {
                Ok(ExecSession {
                    operation: "/1.0/operations/xyz".into(),
                    fds: HashMap::from([
                        ("0".to_string(), "s0".to_string()),
                        ("control".to_string(), "sc".to_string()),
                    ]),
                })
            });

        let terminal = RecordingTerminal::default();
        Orchestrator::new(&api, 4242).shell("web", &terminal).unwrap();
        assert_eq!(terminal.urls.lock().len(), 1);
    }
}
