use super::Cli;
use crate::gitreceive::{HookContext, Orchestrator};
use crate::{object_store, scheduler};
use anyhow::{Context, Result};

impl Cli {
    /// Entry point of the pre-receive hook. A returned error rejects the push.
    pub async fn git_receive(&self, ctx: &HookContext) -> Result<()> {
        let store = object_store::new(&self.conf.object_store)
            .await
            .context("Could not init object store")?;

        let scheduler = scheduler::init_scheduler(&self.conf.scheduler)
            .await
            .context("Could not init scheduler")?;

        let orchestrator = Orchestrator::new(&self.conf, store, scheduler);

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();

        orchestrator
            .run(ctx, stdin, &mut stdout)
            .await
            .with_context(|| format!("Build of '{}' failed", ctx.app()))?;

        Ok(())
    }
}
