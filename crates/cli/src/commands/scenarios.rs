use opsdesk_db::SCENARIOS;

use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    let mut lines = vec![format!("{} scenarios (index, name, user, query):", SCENARIOS.len())];
    lines.extend(SCENARIOS.iter().map(|scenario| {
        format!(
            "- {} {} {} \"{}\"",
            scenario.index, scenario.name, scenario.user_id, scenario.query
        )
    }));
    CommandResult { exit_code: 0, output: lines.join("\n") }
}
