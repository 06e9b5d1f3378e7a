//! JavaScript evaluated inside every execution context before user code.
//!
//! The shim mirrors the host-side fetch surface: Request/Response/Headers
//! classes with idempotent body readers, multipart parsing keyed on the
//! Content-Type boundary, and the `__invoke` entry point that builds the
//! in-sandbox Request from the marshalled payload and normalizes whatever
//! the handler returns. It deliberately exposes no network, filesystem,
//! or timer access.

/// Evaluated once per context, before the deployment's code.
pub const SHIM: &str = r#"
(() => {
    if (globalThis.__surfaceReady) {
        return;
    }
    globalThis.__surfaceReady = true;

    globalThis.process = { env: globalThis.__envVars || {} };

    if (!globalThis.TextEncoder) {
        globalThis.TextEncoder = class TextEncoder {
            encode(input) {
                const str = String(input);
                const utf8 = [];
                for (let i = 0; i < str.length; i++) {
                    let code = str.charCodeAt(i);
                    if (code < 0x80) {
                        utf8.push(code);
                    } else if (code < 0x800) {
                        utf8.push(0xc0 | (code >> 6), 0x80 | (code & 0x3f));
                    } else if (code < 0xd800 || code >= 0xe000) {
                        utf8.push(
                            0xe0 | (code >> 12),
                            0x80 | ((code >> 6) & 0x3f),
                            0x80 | (code & 0x3f)
                        );
                    } else {
                        i++;
                        code = 0x10000 + (((code & 0x3ff) << 10) | (str.charCodeAt(i) & 0x3ff));
                        utf8.push(
                            0xf0 | (code >> 18),
                            0x80 | ((code >> 12) & 0x3f),
                            0x80 | ((code >> 6) & 0x3f),
                            0x80 | (code & 0x3f)
                        );
                    }
                }
                return new Uint8Array(utf8);
            }
        };
    }

    if (!globalThis.TextDecoder) {
        globalThis.TextDecoder = class TextDecoder {
            decode(bytes) {
                if (!bytes) return '';
                const arr = new Uint8Array(bytes.buffer ? bytes.buffer : bytes);
                let str = '';
                let i = 0;
                while (i < arr.length) {
                    const byte = arr[i++];
                    if (byte < 0x80) {
                        str += String.fromCharCode(byte);
                    } else if (byte < 0xe0) {
                        str += String.fromCharCode(((byte & 0x1f) << 6) | (arr[i++] & 0x3f));
                    } else if (byte < 0xf0) {
                        str += String.fromCharCode(
                            ((byte & 0x0f) << 12) | ((arr[i++] & 0x3f) << 6) | (arr[i++] & 0x3f)
                        );
                    } else {
                        const code =
                            ((byte & 0x07) << 18) |
                            ((arr[i++] & 0x3f) << 12) |
                            ((arr[i++] & 0x3f) << 6) |
                            (arr[i++] & 0x3f);
                        const high = ((code - 0x10000) >> 10) | 0xd800;
                        const low = ((code - 0x10000) & 0x3ff) | 0xdc00;
                        str += String.fromCharCode(high, low);
                    }
                }
                return str;
            }
        };
    }

    const ENCODER = new TextEncoder();
    const DECODER = new TextDecoder();
    const BASE64_ALPHABET =
        'ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/';

    function base64Encode(bytes) {
        let output = '';
        for (let i = 0; i < bytes.length; i += 3) {
            const a = bytes[i];
            const b = i + 1 < bytes.length ? bytes[i + 1] : 0;
            const c = i + 2 < bytes.length ? bytes[i + 2] : 0;
            const triple = (a << 16) | (b << 8) | c;
            output += BASE64_ALPHABET[(triple >> 18) & 63];
            output += BASE64_ALPHABET[(triple >> 12) & 63];
            output += i + 1 < bytes.length ? BASE64_ALPHABET[(triple >> 6) & 63] : '=';
            output += i + 2 < bytes.length ? BASE64_ALPHABET[triple & 63] : '=';
        }
        return output;
    }

    function base64Decode(input) {
        const clean = String(input).replace(/=+$/, '');
        const bytes = [];
        let buffer = 0;
        let bits = 0;
        for (const char of clean) {
            const value = BASE64_ALPHABET.indexOf(char);
            if (value < 0) continue;
            buffer = (buffer << 6) | value;
            bits += 6;
            if (bits >= 8) {
                bits -= 8;
                bytes.push((buffer >> bits) & 0xff);
            }
        }
        return new Uint8Array(bytes);
    }

    class Headers {
        constructor(init) {
            this.__entries = [];
            if (init instanceof Headers) {
                for (const [name, value] of init.__entries) {
                    this.append(name, value);
                }
            } else if (Array.isArray(init)) {
                for (const [name, value] of init) {
                    this.append(name, value);
                }
            } else if (init && typeof init === 'object') {
                for (const name in init) {
                    this.append(name, init[name]);
                }
            }
        }

        append(name, value) {
            this.__entries.push([String(name).toLowerCase(), String(value)]);
        }

        set(name, value) {
            const key = String(name).toLowerCase();
            this.__entries = this.__entries.filter(([existing]) => existing !== key);
            this.__entries.push([key, String(value)]);
        }

        get(name) {
            const key = String(name).toLowerCase();
            for (const [existing, value] of this.__entries) {
                if (existing === key) return value;
            }
            return null;
        }

        getAll(name) {
            const key = String(name).toLowerCase();
            return this.__entries
                .filter(([existing]) => existing === key)
                .map(([, value]) => value);
        }

        has(name) {
            return this.get(name) !== null;
        }

        forEach(callback) {
            for (const [name, value] of this.__entries) {
                callback(value, name);
            }
        }
    }

    function parseMultipart(headers, body) {
        const contentType = headers.get('content-type');
        if (!contentType) {
            throw new Error('missing content-type header');
        }
        let boundary = null;
        for (const param of contentType.split(';')) {
            const trimmed = param.trim();
            if (trimmed.startsWith('boundary=')) {
                boundary = trimmed.slice('boundary='.length).replace(/^"|"$/g, '');
                break;
            }
        }
        if (!boundary) {
            throw new Error('content-type has no multipart boundary parameter');
        }

        const fields = {};
        const segments = body.split('--' + boundary);
        for (let i = 1; i < segments.length; i++) {
            let segment = segments[i];
            if (segment.startsWith('--')) break;
            if (segment.startsWith('\r\n')) segment = segment.slice(2);
            else if (segment.startsWith('\n')) segment = segment.slice(1);

            let headerEnd = segment.indexOf('\r\n\r\n');
            let contentStart = headerEnd + 4;
            if (headerEnd < 0) {
                headerEnd = segment.indexOf('\n\n');
                contentStart = headerEnd + 2;
            }
            if (headerEnd < 0) {
                throw new Error('malformed part: missing header terminator');
            }

            const rawHeaders = segment.slice(0, headerEnd);
            let name = null;
            for (const line of rawHeaders.split(/\r?\n/)) {
                if (!line.toLowerCase().startsWith('content-disposition:')) continue;
                for (const param of line.split(';')) {
                    const trimmed = param.trim();
                    if (trimmed.startsWith('name=')) {
                        name = trimmed.slice('name='.length).replace(/^"|"$/g, '');
                    }
                }
            }
            if (name === null) {
                throw new Error('malformed part: missing field name');
            }

            let value = segment.slice(contentStart);
            if (value.endsWith('\r\n')) value = value.slice(0, -2);
            else if (value.endsWith('\n')) value = value.slice(0, -1);
            fields[name] = value;
        }
        return fields;
    }

    // Body readers shared by Request and Response. Reads never mutate the
    // stored body, so repeated calls return the same value.
    const bodyMethods = {
        async text() {
            if (this.body instanceof Uint8Array) {
                return DECODER.decode(this.body);
            }
            if (this.body instanceof ArrayBuffer) {
                return DECODER.decode(new Uint8Array(this.body));
            }
            return this.body == null ? '' : String(this.body);
        },
        async json() {
            return JSON.parse(await this.text());
        },
        async formData() {
            return parseMultipart(this.headers, await this.text());
        },
        async arrayBuffer() {
            if (this.body instanceof Uint8Array) {
                return this.body;
            }
            if (this.body instanceof ArrayBuffer) {
                return new Uint8Array(this.body);
            }
            return ENCODER.encode(this.body == null ? '' : String(this.body));
        },
    };

    class Request {
        constructor(input, options) {
            this.method = (options && options.method) || 'GET';
            this.headers =
                options && options.headers instanceof Headers
                    ? options.headers
                    : new Headers(options && options.headers);
            this.body = options && options.body != null ? options.body : '';
            this.url = input;
        }
    }
    Object.assign(Request.prototype, bodyMethods);

    class Response {
        constructor(body, options) {
            this.body = body != null ? body : '';
            this.status = options && typeof options.status === 'number' ? options.status : 200;
            this.statusText = (options && options.statusText) || '';
            this.headers =
                options && options.headers instanceof Headers
                    ? options.headers
                    : new Headers(options && options.headers);
            this.url = (options && options.url) || '';
            this.ok = this.status >= 200 && this.status < 300;
        }
    }
    Object.assign(Response.prototype, bodyMethods);

    globalThis.Headers = Headers;
    globalThis.Request = Request;
    globalThis.Response = Response;

    globalThis.__invoke = async function () {
        const payload = globalThis.__requestPayload || {};

        const headers = new Headers(payload.headers || []);
        let body = '';
        if (payload.bodyBase64 != null) {
            body = base64Decode(payload.bodyBase64);
        } else if (payload.body != null) {
            body = payload.body;
        }

        const request = new Request(payload.url || '', {
            method: payload.method || 'GET',
            headers,
            body,
        });

        const handler = globalThis.__handler;
        if (typeof handler !== 'function') {
            throw new Error('deployment code does not define a handler function');
        }

        const response = await handler(request);

        const out = {
            status: 200,
            statusText: '',
            headers: [],
            body: '',
            bodyBase64: null,
        };

        if (response && typeof response === 'object') {
            if (typeof response.status === 'number') out.status = response.status;
            if (typeof response.statusText === 'string') out.statusText = response.statusText;

            const responseHeaders = response.headers;
            if (responseHeaders && typeof responseHeaders.forEach === 'function') {
                responseHeaders.forEach((value, name) => {
                    out.headers.push([name, String(value)]);
                });
            } else if (responseHeaders) {
                for (const name in responseHeaders) {
                    out.headers.push([name, String(responseHeaders[name])]);
                }
            }

            const responseBody = response.body;
            if (responseBody instanceof Uint8Array) {
                out.bodyBase64 = base64Encode(responseBody);
            } else if (responseBody instanceof ArrayBuffer) {
                out.bodyBase64 = base64Encode(new Uint8Array(responseBody));
            } else if (typeof responseBody === 'string') {
                out.body = responseBody;
            } else if (responseBody != null) {
                out.body = JSON.stringify(responseBody);
            }
        } else if (response != null) {
            out.body = String(response);
        }

        return out;
    };
})();
"#;

/// Wrap deployment code so its handler is captured without polluting the
/// context's global scope. Import/export statements are not supported;
/// everything must be bundled into the single code unit, so the wrapper
/// only strips the export markers.
pub fn wrap_handler_code(code: &str) -> String {
    let stripped = code
        .replace("export default ", "const __handlerDefault = ")
        .replace("export async function handler", "async function handler")
        .replace("export function handler", "function handler");

    format!(
        "globalThis.__handler = undefined;\n\
         (function() {{\n{}\n\
         if (typeof handler !== 'undefined') {{ globalThis.__handler = handler; }}\n\
         else if (typeof __handlerDefault !== 'undefined') {{ globalThis.__handler = __handlerDefault; }}\n\
         }})();\n\
         if (typeof globalThis.__handler !== 'function') {{\n\
             throw new Error('deployment code does not define a handler function');\n\
         }}",
        stripped
    )
}
