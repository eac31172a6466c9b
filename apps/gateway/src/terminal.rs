/// Minimal terminal client. Reads the session id from the path and the
/// attach token from `?token=`, then opens a WebSocket back to this same
/// URL with the token smuggled as the second subprotocol entry.
pub const TERMINAL_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>wscli terminal</title>
  <link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/xterm@5.3.0/css/xterm.css">
  <script src="https://cdn.jsdelivr.net/npm/xterm@5.3.0/lib/xterm.js"></script>
  <style>
    html, body { margin: 0; height: 100%; background: #000; }
    #terminal { height: 100%; }
  </style>
</head>
<body>
  <div id="terminal"></div>
  <script>
    const term = new Terminal({ cursorBlink: true });
    term.open(document.getElementById('terminal'));

    const token = new URLSearchParams(location.search).get('token');
    const scheme = location.protocol === 'https:' ? 'wss:' : 'ws:';
    const url = scheme + '//' + location.host + location.pathname;
    const ws = token ? new WebSocket(url, ['bearer', token]) : new WebSocket(url);
    ws.binaryType = 'arraybuffer';

    ws.onopen = () => term.focus();
    ws.onmessage = (event) => {
      if (typeof event.data === 'string') {
        term.write(event.data);
      } else {
        term.write(new Uint8Array(event.data));
      }
    };
    ws.onclose = () => term.write('\r\n[session closed]\r\n');
    term.onData((data) => {
      if (ws.readyState === WebSocket.OPEN) ws.send(data);
    });
  </script>
</body>
</html>
"#;
