#[cfg(test)]
mod test {
    use assert_cmd::Command;
    use predicates::prelude::*;

    #[test]
    fn unrecognized_cli_flag_is_rejected() {
        let mut cmd = Command::cargo_bin("yesquel").unwrap();

        cmd.arg("--foobar");
        cmd.assert().failure();
    }

    #[test]
    fn one_shot_begin_reports_the_new_tx_id() {
        let mut cmd = Command::cargo_bin("yesquel").unwrap();
        cmd.arg("--non-interactive").arg("--query=BEGIN");
        cmd.assert().success().stdout(predicate::str::contains("tx 1 started"));
    }

    #[test]
    fn one_shot_unknown_command_exits_with_the_usage_error_code() {
        let mut cmd = Command::cargo_bin("yesquel").unwrap();
        cmd.arg("--non-interactive").arg("--query=BOGUS");
        cmd.assert().failure().code(1);
    }

    #[test]
    fn piped_script_runs_sequential_admin_commands() {
        let mut cmd = Command::cargo_bin("yesquel").unwrap();
        cmd.arg("--non-interactive")
            .write_stdin("BEGIN\nPUT 1 9:1 hello\nCOMMIT 1\n")
            .assert()
            .success()
            .stdout(predicate::str::contains("committed at ts"));
    }
}
