use colored::Colorize;
use policy_sync_core::reconcile::Plan;
use policy_sync_core::{Operation, PolicyResult, PolicyStatus, RunReport};
use tabled::builder::Builder;
use tabled::settings::Style;

const HEADER: [&str; 6] = ["NAME", "TYPE", "PATH", "OPERATION", "STATUS", "MESSAGE"];

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Results ordered so that rows sharing a definition id sit together,
/// keeping first-seen order between and within groups.
fn grouped<'a>(results: impl IntoIterator<Item = &'a PolicyResult>) -> Vec<&'a PolicyResult> {
    let mut groups: Vec<(String, Vec<&PolicyResult>)> = Vec::new();
    for result in results {
        let key = result.policy_definition_id.to_ascii_lowercase();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, rows)) => rows.push(result),
            None => groups.push((key, vec![result])),
        }
    }
    groups.into_iter().flat_map(|(_, rows)| rows).collect()
}

fn results_table<'a>(results: impl IntoIterator<Item = &'a PolicyResult>) -> String {
    let mut builder = Builder::default();
    builder.push_record(HEADER);
    for r in grouped(results) {
        builder.push_record([
            r.display_name.clone(),
            r.result_type.to_string(),
            r.path.clone(),
            r.operation.to_string(),
            r.status.to_string(),
            r.message.clone(),
        ]);
    }
    builder.build().with(Style::rounded()).to_string()
}

pub fn print_report(report: &RunReport) {
    let successes: Vec<&PolicyResult> = report
        .results
        .iter()
        .filter(|r| r.status == PolicyStatus::Succeeded)
        .collect();
    let problems: Vec<&PolicyResult> = report
        .results
        .iter()
        .filter(|r| r.status != PolicyStatus::Succeeded)
        .collect();

    if successes.is_empty() && problems.is_empty() {
        print_success(&format!(
            "Everything is in sync ({} unchanged)",
            report.unchanged
        ));
        return;
    }

    if !successes.is_empty() {
        println!("{}", "Succeeded".green().bold());
        println!("{}", results_table(successes));
    }
    if !problems.is_empty() {
        println!("{}", "Failed".red().bold());
        println!("{}", results_table(problems));
    }

    let summary = format!(
        "{} succeeded, {} failed, {} unresolved, {} unchanged",
        report.count(PolicyStatus::Succeeded),
        report.failed(),
        report.count(PolicyStatus::Unresolved),
        report.unchanged
    );
    if report.is_success() && report.count(PolicyStatus::Unresolved) == 0 {
        print_success(&summary);
    } else if report.is_success() {
        print_warning(&summary);
    } else {
        print_error(&summary);
    }
}

pub fn print_plan(plan: &Plan) {
    if plan.requests.is_empty() && plan.fetch_failures.is_empty() {
        println!("No policies found.");
        return;
    }

    let mut builder = Builder::default();
    builder.push_record(["NAME", "TYPE", "PATH", "OPERATION"]);
    for request in &plan.requests {
        let policy = &request.policy;
        builder.push_record([
            policy.display_name().unwrap_or(policy.name()).to_string(),
            policy.kind().to_string(),
            request.path.clone(),
            request.operation.to_string(),
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()).to_string());

    if !plan.fetch_failures.is_empty() {
        println!("{}", "Could not read".red().bold());
        println!("{}", results_table(&plan.fetch_failures));
    }

    let count = |op: Operation| plan.requests.iter().filter(|r| r.operation == op).count();
    println!(
        "{}: {} to create, {} to update, {} unchanged",
        "Plan".cyan(),
        count(Operation::Create),
        count(Operation::Update),
        count(Operation::None)
    );
}
