//! Default seccomp profile.
//!
//! Everything not listed fails with `EPERM`. `clone` is allowed only when it
//! does not create namespaces and `personality` only for the common
//! personas.

use oci_spec::runtime::{
    Arch, LinuxSeccomp, LinuxSeccompAction, LinuxSeccompArgBuilder, LinuxSeccompBuilder,
    LinuxSeccompOperator, LinuxSyscall, LinuxSyscallBuilder,
};

use img_shared::{ImgError, ImgResult};

/// Syscalls allowed with no argument filter.
const ALLOWED: &[&str] = &[
    "accept", "accept4", "access", "alarm", "bind", "brk", "capget", "capset", "chdir", "chmod",
    "chown", "chown32", "chroot", "clock_getres", "clock_gettime", "clock_nanosleep", "close",
    "connect", "copy_file_range", "creat", "dup", "dup2", "dup3", "epoll_create",
    "epoll_create1", "epoll_ctl", "epoll_ctl_old", "epoll_pwait", "epoll_wait",
    "epoll_wait_old", "eventfd", "eventfd2", "execve", "execveat", "exit", "exit_group",
    "faccessat", "fadvise64", "fadvise64_64", "fallocate", "fanotify_init", "fanotify_mark",
    "fchdir", "fchmod", "fchmodat", "fchown", "fchown32", "fchownat", "fcntl", "fcntl64",
    "fdatasync", "fgetxattr", "flistxattr", "flock", "fork", "fremovexattr", "fsetxattr",
    "fstat", "fstat64", "fstatat64", "fstatfs", "fstatfs64", "fsync", "ftruncate",
    "ftruncate64", "futex", "futimesat", "getcpu", "getcwd", "getdents", "getdents64",
    "getegid", "getegid32", "geteuid", "geteuid32", "getgid", "getgid32", "getgroups",
    "getgroups32", "getitimer", "getpeername", "getpgid", "getpgrp", "getpid", "getppid",
    "getpriority", "getrandom", "getresgid", "getresgid32", "getresuid", "getresuid32",
    "getrlimit", "get_robust_list", "getrusage", "getsid", "getsockname", "getsockopt",
    "get_thread_area", "gettid", "gettimeofday", "getuid", "getuid32", "getxattr",
    "inotify_add_watch", "inotify_init", "inotify_init1", "inotify_rm_watch", "io_cancel",
    "ioctl", "io_destroy", "io_getevents", "ioprio_get", "ioprio_set", "io_setup", "io_submit",
    "ipc", "kill", "lchown", "lchown32", "lgetxattr", "link", "linkat", "listen", "listxattr",
    "llistxattr", "_llseek", "lremovexattr", "lseek", "lsetxattr", "lstat", "lstat64",
    "madvise", "memfd_create", "mincore", "mkdir", "mkdirat", "mknod", "mknodat", "mlock",
    "mlock2", "mlockall", "mmap", "mmap2", "mprotect", "mq_getsetattr", "mq_notify", "mq_open",
    "mq_timedreceive", "mq_timedsend", "mq_unlink", "mremap", "msgctl", "msgget", "msgrcv",
    "msgsnd", "msync", "munlock", "munlockall", "munmap", "nanosleep", "newfstatat",
    "_newselect", "open", "openat", "pause", "pipe", "pipe2", "poll", "ppoll", "prctl",
    "pread64", "preadv", "prlimit64", "pselect6", "pwrite64", "pwritev", "read", "readahead",
    "readlink", "readlinkat", "readv", "recv", "recvfrom", "recvmmsg", "recvmsg",
    "remap_file_pages", "removexattr", "rename", "renameat", "renameat2", "restart_syscall",
    "rmdir", "rt_sigaction", "rt_sigpending", "rt_sigprocmask", "rt_sigqueueinfo",
    "rt_sigreturn", "rt_sigsuspend", "rt_sigtimedwait", "rt_tgsigqueueinfo",
    "sched_getaffinity", "sched_getattr", "sched_getparam", "sched_get_priority_max",
    "sched_get_priority_min", "sched_getscheduler", "sched_rr_get_interval",
    "sched_setaffinity", "sched_setattr", "sched_setparam", "sched_setscheduler", "sched_yield",
    "seccomp", "select", "semctl", "semget", "semop", "semtimedop", "send", "sendfile",
    "sendfile64", "sendmmsg", "sendmsg", "sendto", "setdomainname", "setfsgid", "setfsgid32",
    "setfsuid", "setfsuid32", "setgid", "setgid32", "setgroups", "setgroups32", "sethostname",
    "setitimer", "setpgid", "setpriority", "setregid", "setregid32", "setresgid", "setresgid32",
    "setresuid", "setresuid32", "setreuid", "setreuid32", "setrlimit", "set_robust_list",
    "setsid", "setsockopt", "set_thread_area", "set_tid_address", "setuid", "setuid32",
    "setxattr", "shmat", "shmctl", "shmdt", "shmget", "shutdown", "sigaltstack", "signalfd",
    "signalfd4", "sigreturn", "socket", "socketpair", "splice", "stat", "stat64", "statfs",
    "statfs64", "symlink", "symlinkat", "sync", "sync_file_range", "syncfs", "sysinfo",
    "syslog", "tee", "tgkill", "time", "timer_create", "timer_delete", "timerfd_create",
    "timerfd_gettime", "timerfd_settime", "timer_getoverrun", "timer_gettime", "timer_settime",
    "times", "tkill", "truncate", "truncate64", "ugetrlimit", "umask", "uname", "unlink",
    "unlinkat", "utime", "utimensat", "utimes", "vfork", "vhangup", "vmsplice", "wait4",
    "waitid", "waitpid", "write", "writev",
];

#[cfg(target_arch = "x86_64")]
const ARCH_ALLOWED: &[&str] = &["arch_prctl", "modify_ldt"];
#[cfg(target_arch = "x86")]
const ARCH_ALLOWED: &[&str] = &["modify_ldt"];
#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
const ARCH_ALLOWED: &[&str] = &["breakpoint", "cacheflush", "set_tls"];
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "arm",
    target_arch = "aarch64"
)))]
const ARCH_ALLOWED: &[&str] = &[];

/// `personality(2)` values that stay allowed: PER_LINUX, PER_LINUX32 and
/// the query value.
const PERSONALITIES: &[u64] = &[0x0, 0x0008, 0xffff_ffff];

const NAMESPACE_FLAGS: u64 = (libc::CLONE_NEWNS
    | libc::CLONE_NEWUTS
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWUSER
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWNET) as u64;

/// Architectures the profile applies to on this host.
pub fn arches() -> Vec<Arch> {
    if cfg!(target_arch = "x86_64") {
        vec![Arch::ScmpArchX86_64, Arch::ScmpArchX86, Arch::ScmpArchX32]
    } else if cfg!(target_arch = "aarch64") {
        vec![Arch::ScmpArchArm, Arch::ScmpArchAarch64]
    } else {
        Vec::new()
    }
}

pub fn default_profile() -> ImgResult<LinuxSeccomp> {
    let mut syscalls = vec![allow(
        ALLOWED.iter().chain(ARCH_ALLOWED).map(|s| s.to_string()).collect(),
    )?];

    let no_new_namespaces = LinuxSeccompArgBuilder::default()
        .index(0usize)
        .value(NAMESPACE_FLAGS)
        .value_two(0u64)
        .op(LinuxSeccompOperator::ScmpCmpMaskedEq)
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build clone filter: {}", e)))?;
    syscalls.push(
        LinuxSyscallBuilder::default()
            .names(vec!["clone".to_string()])
            .action(LinuxSeccompAction::ScmpActAllow)
            .args(vec![no_new_namespaces])
            .build()
            .map_err(|e| ImgError::SpecBuild(format!("Failed to build clone rule: {}", e)))?,
    );

    for persona in PERSONALITIES {
        let arg = LinuxSeccompArgBuilder::default()
            .index(0usize)
            .value(*persona)
            .op(LinuxSeccompOperator::ScmpCmpEq)
            .build()
            .map_err(|e| {
                ImgError::SpecBuild(format!("Failed to build personality filter: {}", e))
            })?;
        syscalls.push(
            LinuxSyscallBuilder::default()
                .names(vec!["personality".to_string()])
                .action(LinuxSeccompAction::ScmpActAllow)
                .args(vec![arg])
                .build()
                .map_err(|e| {
                    ImgError::SpecBuild(format!("Failed to build personality rule: {}", e))
                })?,
        );
    }

    LinuxSeccompBuilder::default()
        .default_action(LinuxSeccompAction::ScmpActErrno)
        .architectures(arches())
        .syscalls(syscalls)
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build seccomp profile: {}", e)))
}

fn allow(names: Vec<String>) -> ImgResult<LinuxSyscall> {
    LinuxSyscallBuilder::default()
        .names(names)
        .action(LinuxSeccompAction::ScmpActAllow)
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build syscall rule: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_denies_by_default() {
        let profile = serde_json::to_value(default_profile().unwrap()).unwrap();
        assert_eq!(profile["defaultAction"], "SCMP_ACT_ERRNO");

        let rules = profile["syscalls"].as_array().unwrap();
        let allowed = rules[0]["names"].as_array().unwrap();
        assert!(allowed.iter().any(|n| n == "execve"));
        assert!(!allowed.iter().any(|n| n == "mount"));
        assert!(!allowed.iter().any(|n| n == "clone"));
    }

    #[test]
    fn test_clone_is_filtered() {
        let profile = serde_json::to_value(default_profile().unwrap()).unwrap();
        let clone = profile["syscalls"]
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["names"][0] == "clone")
            .unwrap();
        assert_eq!(clone["args"][0]["op"], "SCMP_CMP_MASKED_EQ");
        assert_eq!(clone["args"][0]["value"], NAMESPACE_FLAGS);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x86_64_arches() {
        assert_eq!(arches().len(), 3);
    }
}
