//! External recognizer backend (e.g. whisper.cpp's `whisper-cli`).
//!
//! One process per item: the whole inference is a single funneled request
//! whose stdout is the transcript. The executable is located once at startup
//! through `ToolPaths`; nothing here touches `PATH` at runtime.
//!
//! The running child sits in a shared slot so an interrupt can kill it
//! while the worker is blocked reading its output. Only the direct child is
//! killed: a wrapper script should `exec` the real recognizer, or its
//! grandchildren keep stdout open until they exit.

use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, ScribeError};
use crate::inference::{Device, Interrupter, LanguageHint, SpeechModel};

/// Default recognizer executable name.
pub const DEFAULT_RECOGNIZER: &str = "whisper-cli";

/// Locations of external tools, resolved once per process.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    recognizer: Option<PathBuf>,
    recognizer_name: String,
}

impl ToolPaths {
    /// Resolve the recognizer: an explicit path wins, otherwise `name` is
    /// looked up in `PATH` followed by `extra_dirs`.
    pub fn resolve(explicit: Option<&Path>, name: &str, extra_dirs: &[PathBuf]) -> Self {
        let recognizer = match explicit {
            Some(p) if p.is_file() => Some(p.to_path_buf()),
            Some(p) => {
                tracing::warn!(path = ?p, "configured recognizer path is not a file");
                None
            }
            None => find_in_path(name, extra_dirs),
        };
        match &recognizer {
            Some(p) => info!(tool = name, path = ?p, "external recognizer resolved"),
            None => debug!(tool = name, "external recognizer not found"),
        }
        Self {
            recognizer,
            recognizer_name: name.to_string(),
        }
    }

    /// # Errors
    /// `ScribeError::ToolNotFound` when resolution failed.
    pub fn recognizer(&self) -> Result<&Path> {
        self.recognizer.as_deref().ok_or_else(|| {
            let name = if self.recognizer_name.is_empty() {
                DEFAULT_RECOGNIZER
            } else {
                &self.recognizer_name
            };
            ScribeError::ToolNotFound(name.to_string())
        })
    }
}

fn find_in_path(tool: &str, extra_dirs: &[PathBuf]) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = env::var_os("PATH")
        .map(|p| env::split_paths(&p).collect())
        .unwrap_or_default();
    dirs.extend(extra_dirs.iter().cloned());

    for dir in dirs {
        let full = dir.join(tool);
        if full.is_file() {
            return Some(full);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{tool}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

/// Argument template. `{model}`, `{audio}` and `{language}` are substituted
/// per call; `cpu_args` are appended when the run targets the CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub args: Vec<String>,
    pub cpu_args: Vec<String>,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        let owned = |xs: &[&str]| -> Vec<String> { xs.iter().map(|s| s.to_string()).collect() };
        Self {
            args: owned(&[
                "-m", "{model}", "-l", "{language}", "-nt", "-np", "-f", "{audio}",
            ]),
            cpu_args: owned(&["-ng"]),
        }
    }
}

impl CommandTemplate {
    fn render(&self, model: &str, audio: &Path, language: &LanguageHint, device: Device) -> Vec<String> {
        let audio = audio.to_string_lossy();
        let language = language.to_string();
        let mut out: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace("{model}", model)
                    .replace("{audio}", &audio)
                    .replace("{language}", &language)
            })
            .collect();
        if device == Device::Cpu {
            out.extend(self.cpu_args.iter().cloned());
        }
        out
    }
}

/// The recognizer process of the call in flight, if any.
#[derive(Default)]
struct RunningChild {
    child: Mutex<Option<Child>>,
    interrupted: AtomicBool,
}

impl RunningChild {
    fn kill(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(child) = self.child.lock().as_mut() {
            let pid = child.id();
            match child.kill() {
                Ok(()) => warn!(pid, "recognizer process killed"),
                // Already exited and waiting to be reaped.
                Err(e) => debug!(pid, error = %e, "recognizer kill failed"),
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

pub struct CommandModel {
    program: PathBuf,
    model: String,
    device: Device,
    template: CommandTemplate,
    ready: bool,
    running: Arc<RunningChild>,
}

impl CommandModel {
    pub fn new(program: PathBuf, model: String, device: Device, template: CommandTemplate) -> Self {
        Self {
            program,
            model,
            device,
            template,
            ready: false,
            running: Arc::new(RunningChild::default()),
        }
    }

    /// Spawn the recognizer, drain both pipes and reap it. The child is
    /// parked in `running` for the whole call.
    fn run_child(&self, args: &[String]) -> Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
        self.running.interrupted.store(false, Ordering::SeqCst);
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.running.child.lock() = Some(child);
        // An interrupt that raced the spawn found an empty slot.
        if self.running.interrupted() {
            self.running.kill();
        }

        let stderr_reader = stderr.map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        let mut out = Vec::new();
        let read = match stdout {
            Some(mut pipe) => pipe.read_to_end(&mut out).map(|_| ()),
            None => Ok(()),
        };

        let child = self.running.child.lock().take();
        let status = match child {
            Some(mut child) => {
                if read.is_err() {
                    let _ = child.kill();
                }
                child.wait()?
            }
            None => return Err(ScribeError::Inference("recognizer process lost".into())),
        };
        read?;
        let err = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        Ok((status, out, err))
    }
}

impl SpeechModel for CommandModel {
    fn warm_up(&mut self) -> Result<()> {
        if !self.program.is_file() {
            return Err(ScribeError::ToolNotFound(
                self.program.to_string_lossy().into_owned(),
            ));
        }
        // Ids that look like paths must point at real weights.
        let model_path = Path::new(&self.model);
        if model_path.components().count() > 1 && !model_path.exists() {
            return Err(ScribeError::ModelNotFound {
                path: model_path.to_path_buf(),
            });
        }
        info!(program = ?self.program, model = %self.model, "command backend ready");
        self.ready = true;
        Ok(())
    }

    fn transcribe(&mut self, audio: &Path, language: &LanguageHint) -> Result<String> {
        if !self.ready {
            return Err(ScribeError::Inference("command backend not warmed up".into()));
        }
        let args = self.template.render(&self.model, audio, language, self.device);
        debug!(program = ?self.program, ?args, "spawning recognizer");

        let (status, stdout, stderr) = self.run_child(&args)?;
        if self.running.interrupted() {
            return Err(ScribeError::Inference(format!(
                "recognizer interrupted ({status})"
            )));
        }

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let tail: String = stderr
                .trim()
                .chars()
                .rev()
                .take(400)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Err(ScribeError::Inference(format!(
                "recognizer exited with {status}: {tail}"
            )));
        }

        let stdout = String::from_utf8_lossy(&stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn release(&mut self) {
        debug!(model = %self.model, "command backend released");
        self.ready = false;
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let running = Arc::clone(&self.running);
        Some(Arc::new(move || running.kill()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitutes_placeholders() {
        let t = CommandTemplate::default();
        let args = t.render(
            "ggml-small.bin",
            Path::new("seg/a.wav"),
            &LanguageHint::Code("nl".into()),
            Device::Cpu,
        );
        assert_eq!(
            args,
            vec!["-m", "ggml-small.bin", "-l", "nl", "-nt", "-np", "-f", "seg/a.wav", "-ng"]
        );

        let gpu = t.render("m", Path::new("a.wav"), &LanguageHint::Auto, Device::Accelerator);
        assert_eq!(gpu.last().map(String::as_str), Some("a.wav"));
        assert!(gpu.contains(&"auto".to_string()));
    }

    #[test]
    fn unresolved_tool_reports_name() {
        let tools = ToolPaths::resolve(None, "surely-not-installed-recognizer", &[]);
        match tools.recognizer() {
            Err(ScribeError::ToolNotFound(name)) => {
                assert_eq!(name, "surely-not-installed-recognizer")
            }
            other => panic!("expected ToolNotFound, got {other:?}"),
        }
    }

    #[test]
    fn extra_dirs_are_searched() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = tmp.path().join("my-recognizer");
        std::fs::write(&tool, b"#!/bin/sh\n").unwrap();

        let tools = ToolPaths::resolve(None, "my-recognizer", &[tmp.path().to_path_buf()]);
        assert_eq!(tools.recognizer().unwrap(), tool.as_path());
    }

    #[cfg(unix)]
    #[test]
    fn runs_script_and_joins_stdout_lines() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("fake-recognizer");
        std::fs::write(&script, "#!/bin/sh\necho ' hallo'\necho ''\necho 'wereld '\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut model = CommandModel::new(
            script,
            "tiny".into(),
            Device::Cpu,
            CommandTemplate::default(),
        );
        model.warm_up().unwrap();
        let text = model
            .transcribe(Path::new("a.wav"), &LanguageHint::Auto)
            .unwrap();
        assert_eq!(text, "hallo wereld");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_inference_error() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("failing-recognizer");
        std::fs::write(&script, "#!/bin/sh\necho 'bad input' >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut model =
            CommandModel::new(script, "tiny".into(), Device::Cpu, CommandTemplate::default());
        model.warm_up().unwrap();
        let err = model
            .transcribe(Path::new("a.wav"), &LanguageHint::Auto)
            .unwrap_err();
        match err {
            ScribeError::Inference(msg) => assert!(msg.contains("bad input"), "{msg}"),
            other => panic!("expected Inference, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn interrupter_kills_a_hung_recognizer() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::{Duration, Instant};

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("hung-recognizer");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut model =
            CommandModel::new(script, "tiny".into(), Device::Cpu, CommandTemplate::default());
        model.warm_up().unwrap();
        let interrupt = model.interrupter().unwrap();

        let started = Instant::now();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            interrupt();
        });
        let err = model
            .transcribe(Path::new("a.wav"), &LanguageHint::Auto)
            .unwrap_err();
        killer.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            ScribeError::Inference(msg) => assert!(msg.contains("interrupted"), "{msg}"),
            other => panic!("expected Inference, got {other:?}"),
        }
    }
}
