use sandvisor_host::{
    is_hypervisor_present, GuestBinary, SandboxConfiguration, SandboxRunOptions, UninitializedSandbox,
};
use sandvisor_testing::simple_guest_as_pathbuf;

fn new_sandbox(run_options: SandboxRunOptions) -> sandvisor_host::MultiUseSandbox {
    let usbox = UninitializedSandbox::new(
        GuestBinary::File(simple_guest_as_pathbuf()),
        SandboxConfiguration::default(),
        run_options,
    )
    .unwrap();
    usbox.initialize(|_| Ok(())).unwrap()
}

#[test]
#[ignore = "requires a hardware-virtualized host and a built simpleguest.exe fixture"]
fn echo_round_trips_through_a_recyclable_sandbox() {
    if !is_hypervisor_present() {
        panic!("no hypervisor is present");
    }
    let mut sandbox = new_sandbox(SandboxRunOptions::RecycleAfterRun);
    let echoed: String = sandbox
        .call_guest_function("Echo", vec!["integration".to_string().into()])
        .unwrap();
    assert_eq!(echoed, "integration");
}
