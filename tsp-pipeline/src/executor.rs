//! Shared executor plumbing: plugin holders, restart handling, outcomes.

use tsp_plugin::{InputPlugin, OutputPlugin, PluginContext, ProcessorPlugin, Report};

use crate::ledger::RestartRequest;

/// Result of one executor thread.
#[derive(Debug)]
pub(crate) struct ExecutorOutcome {
    pub stage: usize,
    pub name: String,
    /// Set when the stage aborted on a fatal condition.
    pub fatal: Option<String>,
    /// Packets this stage handed to its plugin (output: packets sent).
    pub packets: u64,
}

/// Start/stop access uniform over the three plugin trait objects, so the
/// restart logic can be written once.
pub(crate) trait Restartable {
    fn do_start(&mut self) -> tsp_plugin::Result<()>;
    fn do_stop(&mut self) -> tsp_plugin::Result<()>;
}

impl Restartable for dyn InputPlugin {
    fn do_start(&mut self) -> tsp_plugin::Result<()> {
        self.start()
    }
    fn do_stop(&mut self) -> tsp_plugin::Result<()> {
        self.stop()
    }
}

impl Restartable for dyn ProcessorPlugin {
    fn do_start(&mut self) -> tsp_plugin::Result<()> {
        self.start()
    }
    fn do_stop(&mut self) -> tsp_plugin::Result<()> {
        self.stop()
    }
}

impl Restartable for dyn OutputPlugin {
    fn do_start(&mut self) -> tsp_plugin::Result<()> {
        self.start()
    }
    fn do_stop(&mut self) -> tsp_plugin::Result<()> {
        self.stop()
    }
}

/// A stage's plugin instance together with what is needed to rebuild it:
/// its factory, its current arguments and its context.
pub(crate) struct PluginCell<P: Restartable + ?Sized> {
    pub plugin: Box<P>,
    pub factory: fn(PluginContext, &[String]) -> tsp_plugin::Result<Box<P>>,
    pub args: Vec<String>,
    pub context: PluginContext,
}

impl<P: Restartable + ?Sized> PluginCell<P> {
    pub fn new(
        plugin: Box<P>,
        factory: fn(PluginContext, &[String]) -> tsp_plugin::Result<Box<P>>,
        args: Vec<String>,
        context: PluginContext,
    ) -> Self {
        Self {
            plugin,
            factory,
            args,
            context,
        }
    }

    /// Perform a pending restart: stop the instance, rebuild it with the
    /// new arguments (falling back to the previous ones on failure) and
    /// start it again. Returns false when the plugin could not be
    /// brought back up.
    pub fn handle_restart(&mut self, request: RestartRequest, report: &Report) -> bool {
        report.verbose("restarting plugin");
        if let Err(e) = self.plugin.do_stop() {
            report.warning(&format!("error stopping plugin for restart: {e}"));
        }

        if let Some(new_args) = request.args.clone() {
            match (self.factory)(self.context.clone(), &new_args) {
                Ok(instance) => {
                    self.plugin = instance;
                    self.args = new_args;
                }
                Err(e) => {
                    report.warning(&format!(
                        "restart with new arguments failed ({e}), keeping previous arguments"
                    ));
                    match (self.factory)(self.context.clone(), &self.args) {
                        Ok(instance) => self.plugin = instance,
                        Err(e) => {
                            let message = format!("cannot rebuild plugin: {e}");
                            report.error(&message);
                            request.complete(Err(message));
                            return false;
                        }
                    }
                }
            }
        }

        match self.plugin.do_start() {
            Ok(()) => {
                request.complete(Ok(()));
                true
            }
            Err(e) => {
                let message = format!("plugin failed to restart: {e}");
                report.error(&message);
                request.complete(Err(message));
                false
            }
        }
    }

    /// Stop the plugin at end of processing, reporting failures.
    pub fn stop_plugin(&mut self, report: &Report) {
        if let Err(e) = self.plugin.do_stop() {
            report.error(&format!("error stopping plugin: {e}"));
        }
    }
}
