#[test]
fn ui() {
    let t = trybuild::TestCases::new();

    t.pass("tests/ui/step_input_valid.rs");
    t.pass("tests/ui/step_input_renamed.rs");
}
