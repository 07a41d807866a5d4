pub const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="ja">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Study Buddy</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 0; background: #f4f5f7; color: #222; }
  header { background: #2d3e50; color: #fff; padding: 12px 20px; }
  main { display: grid; grid-template-columns: repeat(auto-fit, minmax(340px, 1fr)); gap: 16px; padding: 16px; }
  section { background: #fff; border-radius: 8px; padding: 16px; box-shadow: 0 1px 3px rgba(0,0,0,.1); }
  h2 { margin-top: 0; font-size: 1.05rem; }
  label { display: block; margin: 6px 0 2px; font-size: .85rem; color: #555; }
  input[type=text], input[type=number] { width: 100%; box-sizing: border-box; padding: 4px 6px; }
  button { margin: 6px 6px 0 0; padding: 6px 12px; border: 0; border-radius: 4px; background: #3b7ddd; color: #fff; cursor: pointer; }
  button.stop { background: #d9534f; }
  .rule { display: flex; gap: 4px; margin-bottom: 4px; }
  .rule input { flex: 1; }
  .ok { color: #2e7d32; } .ng { color: #c62828; }
  table { width: 100%; border-collapse: collapse; font-size: .85rem; }
  td, th { border-bottom: 1px solid #eee; padding: 4px; text-align: left; vertical-align: top; }
  img.thumb { max-width: 120px; }
  #preview img { max-width: 100%; }
  #toast { position: fixed; right: 16px; bottom: 16px; background: #333; color: #fff; padding: 8px 14px; border-radius: 4px; display: none; }
</style>
</head>
<body>
<header><strong>Study Buddy</strong> 学習見守りダッシュボード</header>
<main>
  <section>
    <h2>監視</h2>
    <div id="status">読み込み中...</div>
    <button onclick="startMonitor()">開始</button>
    <button class="stop" onclick="stopMonitor()">停止</button>
    <div id="preview"></div>
  </section>

  <section>
    <h2>設定</h2>
    <div id="rules"></div>
    <button onclick="addRule()">ルール追加</button>
    <label>撮影間隔（秒）</label><input type="number" id="capture_interval">
    <label>最小通知間隔（分）</label><input type="number" id="min_notify_interval">
    <label>最大通知間隔（分）</label><input type="number" id="max_notify_interval">
    <label>連続失敗の上限</label><input type="number" id="consecutive_fail_limit">
    <label>プレビュー時間（秒）</label><input type="number" id="preview_duration">
    <label><input type="checkbox" id="enable_preview"> 開始時にプレビュー</label>
    <label>自動開始</label><input type="text" id="auto_start_time" placeholder="09:00">
    <label>自動停止</label><input type="text" id="auto_stop_time" placeholder="18:00">
    <label><input type="checkbox" id="enable_time_scheduler"> 時刻スケジューラ</label>
    <button onclick="saveConfig()">保存</button>
  </section>

  <section>
    <h2>通知先</h2>
    <label>受信者（a|b）</label><input type="text" id="recipients">
    <button onclick="saveRecipients()">保存</button>
    <label>テスト送信先ID</label><input type="text" id="test_recipient">
    <button onclick="testRecipient()">テスト送信</button>
  </section>

  <section style="grid-column: 1 / -1">
    <h2>最近の記録</h2>
    <table><thead><tr><th>時刻</th><th>判定</th><th>不合格</th><th>通知</th><th>画像</th></tr></thead>
    <tbody id="records"></tbody></table>
  </section>
</main>
<div id="toast"></div>
<script>
const NUM_FIELDS = ["capture_interval", "min_notify_interval", "max_notify_interval", "consecutive_fail_limit", "preview_duration"];
const TEXT_FIELDS = ["auto_start_time", "auto_stop_time"];
const BOOL_FIELDS = ["enable_preview", "enable_time_scheduler"];

function toast(msg) {
  const el = document.getElementById("toast");
  el.textContent = msg; el.style.display = "block";
  setTimeout(() => el.style.display = "none", 3000);
}

async function api(path, body) {
  const opts = body === undefined ? {} : { method: "POST", headers: { "Content-Type": "application/json" }, body: JSON.stringify(body) };
  const res = await fetch(path, opts);
  const json = await res.json().catch(() => ({ success: false, message: res.statusText }));
  if (!json.success && json.message) toast(json.message);
  return json;
}

function esc(s) { return String(s).replace(/[&<>"]/g, c => ({ "&": "&amp;", "<": "&lt;", ">": "&gt;", '"': "&quot;" }[c])); }

function addRule(key = "", pattern = "") {
  const div = document.createElement("div");
  div.className = "rule";
  div.innerHTML = `<input type="text" class="key" value="${esc(key)}" placeholder="key"><input type="text" class="pattern" value="${esc(pattern)}" placeholder="pattern"><button class="stop" onclick="this.parentNode.remove()">×</button>`;
  document.getElementById("rules").appendChild(div);
}

async function loadConfig() {
  const res = await api("/api/config");
  if (!res.success) return;
  const c = res.data;
  document.getElementById("rules").innerHTML = "";
  c.rules.forEach(r => addRule(r.key, r.pattern));
  NUM_FIELDS.concat(TEXT_FIELDS).forEach(f => document.getElementById(f).value = c[f]);
  BOOL_FIELDS.forEach(f => document.getElementById(f).checked = c[f]);
}

async function saveConfig() {
  const patch = { rules: [...document.querySelectorAll(".rule")].map(r => ({ key: r.querySelector(".key").value, pattern: r.querySelector(".pattern").value })) };
  NUM_FIELDS.concat(TEXT_FIELDS).forEach(f => patch[f] = document.getElementById(f).value);
  BOOL_FIELDS.forEach(f => patch[f] = document.getElementById(f).checked);
  const res = await api("/api/config", patch);
  if (res.success) { toast(res.message); loadConfig(); }
}

async function loadStatus() {
  const res = await api("/api/status");
  if (!res.success) return;
  const s = res.data;
  const last = s.last_decision ? esc(s.last_decision.reason) : "-";
  document.getElementById("status").innerHTML =
    `状態: <b>${s.state}</b>${s.stop_reason ? "（" + s.stop_reason + "）" : ""}<br>` +
    `処理数: ${s.snapshots_processed} / 通知: ${s.notifications_sent} / 連続失敗: ${s.consecutive_failures}<br>` +
    `スケジューラ: ${s.scheduler_running ? "有効" : "無効"} ${s.auto_start_time}-${s.auto_stop_time}<br>` +
    `直近の判定: ${last}`;
}

async function startMonitor() {
  const res = await api("/api/monitor/start", {});
  if (!res.success) return;
  toast(res.message);
  if (res.data.preview_duration > 0) showPreview();
  loadStatus();
}

async function stopMonitor() {
  const res = await api("/api/monitor/stop", {});
  if (res.success) toast(res.message);
  document.getElementById("preview").innerHTML = "";
  loadStatus();
}

function showPreview() {
  document.getElementById("preview").innerHTML = `<img src="/video_feed?t=${Date.now()}">`;
  const timer = setInterval(async () => {
    const res = await api("/api/preview/status");
    if (!res.success || !res.data.active) {
      clearInterval(timer);
      document.getElementById("preview").innerHTML = "";
    }
  }, 1000);
}

async function saveRecipients() {
  const res = await api("/api/messenger/save_recipients", { recipients: document.getElementById("recipients").value });
  if (res.success) toast(res.message);
}

async function testRecipient() {
  const res = await api("/api/messenger/test", { recipient_id: document.getElementById("test_recipient").value });
  if (res.message) toast(res.message);
}

async function loadRecords() {
  const res = await api("/api/records/recent?limit=20");
  if (!res.success) return;
  document.getElementById("records").innerHTML = res.data.records.map(r =>
    `<tr><td>${esc(r.timestamp.replace("T", " "))}</td>` +
    `<td class="${r.is_valid ? "ok" : "ng"}">${r.is_valid ? "合格" : "不合格"}</td>` +
    `<td>${esc(r.failed_keys.join(", "))}</td><td>${r.should_notify ? "✔" : ""}</td>` +
    `<td><img class="thumb" src="/image?path=${encodeURIComponent(r.image_path)}"></td></tr>`).join("");
}

loadConfig(); loadStatus(); loadRecords();
setInterval(loadStatus, 5000);
setInterval(loadRecords, 15000);
</script>
</body>
</html>
"##;
