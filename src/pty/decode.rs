//! PTY 输出解码
//!
//! PTY 输出是字节流，一次读取可能在多字节 UTF-8 字符中间截断。
//! 解码器把不完整的尾部留到下一块再拼接，无效字节替换为 U+FFFD。

/// UTF-8 最长编码字节数
const MAX_UTF8_LEN: usize = 4;

/// 按会话保存状态的流式 UTF-8 解码器
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解码一块输出
    ///
    /// 返回本块可以确定的文本；末尾不完整的字符保留到下一次调用。
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + invalid..];
                        }
                        None => {
                            // 截断的字符，留到下一块
                            debug_assert!(rest.len() - valid < MAX_UTF8_LEN);
                            self.pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// 流结束时输出剩余字节
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }

    /// 是否有未输出的字节
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
