// 组合探测脚本
//
// 一次 exec 依次输出各段，每段以固定标记开头，顺序固定：
// STATS -> PROCESSES -> DOMAINS -> PM2 -> PORTS -> END
// 远端工具是否可用取决于环境，每段都可能为空

pub const MARKER_STATS: &str = "---STATS---";
pub const MARKER_PROCESSES: &str = "---PROCESSES---";
pub const MARKER_DOMAINS: &str = "---DOMAINS---";
pub const MARKER_PM2: &str = "---PM2---";
pub const MARKER_PORTS: &str = "---PORTS---";
pub const MARKER_END: &str = "---END---";

/// 按输出顺序排列的全部标记
pub static MARKERS: [&str; 6] = [
    MARKER_STATS,
    MARKER_PROCESSES,
    MARKER_DOMAINS,
    MARKER_PM2,
    MARKER_PORTS,
    MARKER_END,
];

// 指标行前缀
pub const PREFIX_CPU: &str = "CPU_VAL:";
pub const PREFIX_MEM: &str = "MEM_VAL:";
pub const PREFIX_DISK: &str = "DISK_VAL:";
pub const PREFIX_UPTIME: &str = "UPTIME_VAL:";

/// 系统状态探测脚本
pub const STATS_SCRIPT: &str = r#"
echo "---STATS---"
cpu=$(top -bn1 2>/dev/null | grep -i 'cpu(s)' | head -1 | sed 's/.*, *\([0-9.]*\)[% ]*id.*/\1/' | awk '{printf "%.1f", 100 - $1}')
echo "CPU_VAL:${cpu:-0}"
mem=$(free 2>/dev/null | awk '/^Mem:/ {printf "%.1f", $3/$2 * 100}')
echo "MEM_VAL:${mem:-0}"
disk=$(df -h / 2>/dev/null | awk 'NR==2 {print $5}')
echo "DISK_VAL:${disk:-0%}"
echo "UPTIME_VAL:$(uptime 2>/dev/null | sed 's/^ *[0-9:]* *//')"

echo "---PROCESSES---"
ps aux --sort=-%cpu 2>/dev/null | awk 'NR>1 && NR<=11 {print $1"|"$2"|"$3"|"$4"|"$11}'

echo "---DOMAINS---"
for f in /etc/nginx/sites-enabled/* /etc/nginx/conf.d/*.conf; do
    [ -f "$f" ] && grep -H 'server_name' "$f" 2>/dev/null
done
for f in /etc/apache2/sites-enabled/* /etc/httpd/conf.d/*.conf; do
    [ -f "$f" ] && grep -HE 'ServerName|ServerAlias' "$f" 2>/dev/null
done

echo "---PM2---"
if command -v pm2 >/dev/null 2>&1; then
    pm2 jlist 2>/dev/null || echo "[]"
else
    echo "[]"
fi

echo "---PORTS---"
if command -v ss >/dev/null 2>&1; then
    ss -tlnp 2>/dev/null | tail -n +2
elif command -v netstat >/dev/null 2>&1; then
    netstat -tlnp 2>/dev/null | tail -n +3
else
    echo "No port info"
fi

echo "---END---"
"#;
