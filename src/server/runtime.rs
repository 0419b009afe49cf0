/// Container-aware sizing of the tokio worker pool.
///
/// tokio defaults to the host CPU count, which over-provisions threads
/// when the LB container is limited to a couple of cores on a large
/// metal host. Detection order: explicit `CEEMS_LB_CPU_LIMIT` override
/// (supports "4" and k8s-style "4000m"), cgroup v2 `cpu.max`, cgroup v1
/// `cpu.cfs_quota_us`/`cpu.cfs_period_us`, then the host parallelism.
pub fn get_container_cpu_limit() -> usize {
    let detected = cpu_limit_from_env()
        .or_else(cpu_limit_from_cgroup_v2)
        .or_else(cpu_limit_from_cgroup_v1)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
        });

    let threads = detected.max(1);
    eprintln!("[runtime] worker threads: {}", threads);
    threads
}

fn cpu_limit_from_env() -> Option<usize> {
    let value = std::env::var("CEEMS_LB_CPU_LIMIT").ok()?;
    let value = value.trim();
    if let Some(millicores) = value.strip_suffix('m') {
        millicores.parse::<usize>().ok().map(|m| m / 1000)
    } else {
        value.parse::<usize>().ok()
    }
}

fn cpu_limit_from_cgroup_v2() -> Option<usize> {
    let max = std::fs::read_to_string("/sys/fs/cgroup/cpu.max").ok()?;
    parse_cgroup_v2_cpu(&max)
}

fn cpu_limit_from_cgroup_v1() -> Option<usize> {
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?;
    parse_cgroup_v1_cpu(&quota, &period)
}

/// cgroup v2 `cpu.max` is "quota period", or "max period" when unlimited.
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota: i64 = parts.next()?.parse().ok()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}

/// cgroup v1 legacy hierarchy: quota and period live in separate files;
/// quota is -1 when unlimited.
fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
