//! Patches fixtures compiled into this binary and checks every step.

use anyhow::{bail, ensure, Context, Result};
use log::{debug, info};
use rehook_intercept::{CodeAddress, EngineConfig, HookError, HookRequest, InterceptionEngine};

/// Exported from the binary so it can be resolved by name as well.
#[no_mangle]
#[inline(never)]
pub extern "C" fn rehook_fixture_answer() -> i32 {
    42
}

#[inline(never)]
extern "C" fn fixture_99() -> i32 {
    99
}

#[inline(never)]
extern "C" fn fixture_7() -> i32 {
    7
}

fn address(f: extern "C" fn() -> i32) -> CodeAddress {
    CodeAddress::new(f as usize)
}

pub fn run(config: EngineConfig) -> Result<()> {
    let engine = InterceptionEngine::with_config(config);
    let caps = engine.capabilities();
    debug!("platform capabilities: {caps:?}");
    if !caps.inline_patch {
        bail!("inline patching is not available on this platform");
    }

    let target = address(rehook_fixture_answer);
    #[cfg(target_os = "linux")]
    check_own_export(&engine, target)?;

    let call = |address: CodeAddress| unsafe { engine.invoke(address) }.context("calling fixture");

    ensure!(call(target)? == 42, "fixture returned the wrong value before hooking");

    let report = engine
        .install_with(target, HookRequest::new(address(fixture_99)))
        .context("installing hook")?;
    for warning in &report.warnings {
        info!("install warning: {warning}");
    }
    let trampoline = report.record.trampoline_address.context("no trampoline published")?;
    ensure!(call(target)? == 99, "hooked fixture did not reach the replacement");
    ensure!(call(trampoline)? == 42, "trampoline did not run the original");
    info!("hooked {target}: 42 -> 99, trampoline {trampoline} -> 42");

    match engine.install(target, address(fixture_7)) {
        Err(HookError::AlreadyHooked { .. }) => {}
        Ok(_) => bail!("second hook on {target} was accepted"),
        Err(e) => return Err(e).context("second hook failed for the wrong reason"),
    }
    ensure!(call(target)? == 99, "rejected hook changed the target");

    engine.remove(target).context("removing hook")?;
    ensure!(call(target)? == 42, "fixture not restored after removal");
    ensure!(engine.hooks().is_empty(), "registry not empty after removal");
    info!("removed hook on {target}: back to 42");
    Ok(())
}

/// The fixture's exported name must resolve to the function itself.
#[cfg(target_os = "linux")]
fn check_own_export(engine: &InterceptionEngine, target: CodeAddress) -> Result<()> {
    let exe = std::env::current_exe().context("locating own executable")?;
    let module = exe
        .file_name()
        .and_then(|name| name.to_str())
        .context("executable name is not valid UTF-8")?;
    let resolved = engine
        .resolve_by_export(module, "rehook_fixture_answer")
        .with_context(|| format!("resolving rehook_fixture_answer in {module}"))?;
    ensure!(resolved == target, "export resolved to {resolved}, function is at {target}");
    debug!("{module}!rehook_fixture_answer = {resolved}");
    Ok(())
}
