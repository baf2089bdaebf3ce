//! End-to-end tests through the [`Shell`] facade: scripts, pipelines,
//! redirections, job control, and guest module dispatch.

use std::sync::Arc;
use std::time::Duration;

use limpet::{JobStatus, MemoryVfs, Shell, ShellConfig, Vfs};

fn shell_with_vfs(vfs: Arc<MemoryVfs>) -> Shell {
    Shell::new(&ShellConfig::default(), vfs).unwrap()
}

#[tokio::test]
async fn test_script_with_functions_pipes_and_redirects() {
    let vfs = Arc::new(MemoryVfs::new());
    let mut shell = shell_with_vfs(vfs.clone());

    let script = "\
export NAME=world
greet() { echo hello $1; }
greet $NAME
echo hello filed > /tmp/out.txt
cat /tmp/out.txt | grep hello";

    let result = shell.execute(script).await;
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "hello world\nhello filed\n");
    assert_eq!(vfs.read_file("/tmp/out.txt").await.unwrap(), b"hello filed\n");
}

#[tokio::test]
async fn test_control_flow_drives_output() {
    let mut shell = shell_with_vfs(Arc::new(MemoryVfs::new()));
    let script = "\
for x in a b; do
echo item $x
done
if [ \"$MISSING\" = \"\" ]; then
echo empty
fi";
    let result = shell.execute(script).await;
    assert_eq!(result.stdout, "item a\nitem b\nempty\n");
}

#[tokio::test]
async fn test_state_persists_across_calls() {
    let vfs = Arc::new(MemoryVfs::new());
    vfs.add_dir("/data");
    let mut shell = shell_with_vfs(vfs);

    assert_eq!(shell.execute("X=1").await.exit_code, 0);
    assert_eq!(shell.execute("echo $X").await.stdout, "1\n");

    assert_eq!(shell.execute("cd /data").await.exit_code, 0);
    assert_eq!(shell.cwd(), "/data");
    assert_eq!(shell.execute("pwd").await.stdout, "/data\n");
}

#[tokio::test]
async fn test_guest_module_dispatched_from_path() {
    let binary: Vec<u8> = wat::parse_str(
        r#"
        (module
          (import "env" "get_arg" (func $ga (param i32 i32 i32) (result i32)))
          (import "env" "write_stdout" (func $ws (param i32 i32)))
          (import "env" "set_exit_code" (func $ec (param i32)))
          (memory (export "memory") 1)
          (func (export "main")
            (call $ws (i32.const 0) (call $ga (i32.const 1) (i32.const 0) (i32.const 64)))
            (call $ec (i32.const 0))))
    "#,
    )
    .unwrap();
    let vfs = Arc::new(MemoryVfs::new());
    vfs.add_file("/bin/shout.wasm", binary);
    let mut shell = shell_with_vfs(vfs);

    let result = shell.execute("shout loud").await;
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "loud");

    // Second invocation hits the compiled-module cache.
    let result = shell.execute("shout again").await;
    assert_eq!(result.stdout, "again");
}

#[tokio::test]
async fn test_module_output_flows_through_pipeline() {
    let binary: Vec<u8> = wat::parse_str(
        r#"
        (module
          (import "env" "write_stdout" (func $ws (param i32 i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "alpha\nbeta\n")
          (func (export "main") (call $ws (i32.const 0) (i32.const 11))))
    "#,
    )
    .unwrap();
    let vfs = Arc::new(MemoryVfs::new());
    vfs.add_file("/bin/lines.wasm", binary);
    let mut shell = shell_with_vfs(vfs);

    let result = shell.execute("lines | grep beta").await;
    assert_eq!(result.stdout, "beta\n");
}

#[tokio::test(start_paused = true)]
async fn test_background_job_lifecycle() {
    let mut shell = shell_with_vfs(Arc::new(MemoryVfs::new()));

    let result = shell.execute("sleep 5 &\njobs").await;
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains("[1]"));
    assert!(result.stdout.contains("running sleep 5"));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(shell.jobs().get_job(1).unwrap().status, JobStatus::Completed);

    let notes = shell.take_notifications();
    assert!(notes.iter().any(|n| n.contains("done")));
    assert!(shell.take_notifications().is_empty());
}

#[tokio::test]
async fn test_shell_recovers_after_failure() {
    let mut shell = shell_with_vfs(Arc::new(MemoryVfs::new()));

    assert_eq!(shell.execute("false").await.exit_code, 1);
    assert_eq!(shell.execute("echo alive").await.stdout, "alive\n");

    assert_eq!(shell.execute("exit 3").await.exit_code, 3);
    assert_eq!(shell.execute("echo back").await.stdout, "back\n");
}

#[tokio::test]
async fn test_failure_halts_and_reports() {
    let mut shell = shell_with_vfs(Arc::new(MemoryVfs::new()));
    let result = shell.execute("frobnicate\necho unreached").await;
    assert_eq!(result.exit_code, 127);
    assert!(result.stderr.contains("command not found"));
    assert!(!result.stdout.contains("unreached"));
}
