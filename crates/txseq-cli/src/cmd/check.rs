use crate::output::print_json;
use crate::plan::Plan;
use anyhow::Context;
use std::path::Path;

pub fn run(plan_path: &Path, json: bool) -> anyhow::Result<()> {
    let plan = Plan::load(plan_path)
        .with_context(|| format!("failed to load plan {}", plan_path.display()))?;
    let issues = plan.validate();

    if json {
        print_json(&serde_json::json!({
            "plan": plan_path,
            "steps": plan.steps.len(),
            "issues": issues,
        }))?;
    } else if issues.is_empty() {
        println!("Plan is valid: {} step(s).", plan.steps.len());
    } else {
        for issue in &issues {
            println!("[error] {issue}");
        }
    }

    if !issues.is_empty() {
        anyhow::bail!("plan validation found {} issue(s)", issues.len());
    }
    Ok(())
}
